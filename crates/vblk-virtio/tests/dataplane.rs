mod common;

use common::{pattern, wait_until, Harness, STATUS_UNSET};
use vblk_storage::{BackendError, OpKind};
use vblk_virtio::context::IoThreadRegistry;
use vblk_virtio::devices::blk::*;

#[test]
fn guest_kick_starts_the_dataplane_once() {
    let mut h = Harness::new(BlkConf::default());
    let w = h.add_write(0, 0, &pattern(1, 512));
    h.kick(0);
    assert!(h.dev.dataplane_started());
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);
    assert!(h.transport.guest_notifiers_assigned());
    assert_eq!(h.transport.host_notifiers_assigned(), 1);
    assert_eq!(h.backend.attached_context().as_deref(), Some("main-loop"));

    let calls = h.transport.setup_calls();
    h.dev.start().unwrap();
    h.kick(0);
    assert_eq!(h.transport.setup_calls(), calls);

    h.dev.stop();
    assert!(!h.dev.dataplane_started());
    assert!(!h.transport.guest_notifiers_assigned());
    assert_eq!(h.transport.host_notifiers_assigned(), 0);
    // Stopping twice is harmless.
    h.dev.stop();
}

#[test]
fn no_autostart_while_the_vm_is_stopped() {
    let mut h = Harness::new(BlkConf::default());
    h.dev.vm_state_change(false);
    let w = h.add_write(0, 0, &pattern(1, 512));
    h.kick(0);
    assert!(!h.dev.dataplane_started());
    // Processed inline instead.
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);

    h.dev.vm_state_change(true);
    h.kick(0);
    assert!(h.dev.dataplane_started());
}

#[test]
fn host_notifier_failure_rolls_back_and_falls_back_to_inline() {
    let mut h = Harness::new(BlkConf {
        num_queues: 3,
        ..Default::default()
    });
    h.transport.fail_host_notifier(Some(2));
    let err = h.dev.start().unwrap_err();
    assert!(matches!(err, StartError::HostNotifier { queue: 2, .. }));
    assert_eq!(h.transport.host_notifiers_assigned(), 0);
    assert!(!h.transport.guest_notifiers_assigned());
    assert!(h.dev.dataplane_disabled());
    assert!(!h.dev.dataplane_started());

    let w = h.add_write(1, 0, &pattern(2, 512));
    h.kick(1);
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);
    assert!(!h.dev.dataplane_started());

    // Stop only clears the disabled flag; the next kick tries again.
    h.dev.stop();
    assert!(!h.dev.dataplane_disabled());
    h.transport.fail_host_notifier(None);
    h.kick(0);
    assert!(h.dev.dataplane_started());
    assert_eq!(h.transport.host_notifiers_assigned(), 3);
}

#[test]
fn guest_notifier_failure_disables_the_dataplane() {
    let h = Harness::new(BlkConf::default());
    h.transport.fail_guest_notifiers(true);
    assert!(matches!(
        h.dev.start(),
        Err(StartError::GuestNotifiers(_))
    ));
    assert!(h.dev.dataplane_disabled());
    assert_eq!(h.transport.host_notifiers_assigned(), 0);
}

#[test]
fn backend_context_move_failure_is_not_fatal() {
    let h = Harness::new(BlkConf::default());
    h.backend.fail_attach(true);
    h.dev.start().unwrap();
    assert!(h.dev.dataplane_started());
    assert_eq!(h.backend.attached_context(), None);
}

#[test]
fn stop_waits_for_in_flight_requests() {
    let mut h = Harness::new(BlkConf::default());
    h.backend.set_deferred(true);
    let r = h.add_read(0, 0, 512);
    h.kick(0);
    assert!(h.dev.dataplane_started());
    assert_eq!(h.backend.deferred_len(), 1);
    assert_eq!(h.dev.requests_in_flight(0), 1);
    assert_eq!(h.status(&r), STATUS_UNSET);

    h.dev.stop();
    assert_eq!(h.backend.deferred_len(), 0);
    assert_eq!(h.dev.requests_in_flight(0), 0);
    assert_eq!(h.status(&r), VIRTIO_BLK_S_OK);
    assert_eq!(h.backend.attached_context().as_deref(), Some("main-loop"));
}

#[test]
fn completions_out_of_submission_order_still_land() {
    let mut h = Harness::new(BlkConf {
        ioeventfd: false,
        request_merging: false,
        ..Default::default()
    });
    h.backend.set_deferred(true);
    let a = h.add_write(0, 0, &pattern(1, 512));
    let b = h.add_write(0, 8, &pattern(2, 512));
    h.kick(0);
    assert_eq!(h.backend.complete_deferred_reversed(), 2);
    h.pump();
    let used: Vec<u16> = h.queues[0].used().iter().map(|u| u.head).collect();
    assert_eq!(used, vec![b.head, a.head]);
}

#[test]
fn drained_section_holds_back_new_requests() {
    let mut h = Harness::new(BlkConf {
        ioeventfd: false,
        ..Default::default()
    });
    h.dev.drained_begin();
    h.dev.drained_begin();
    let w = h.add_write(0, 0, &pattern(3, 512));
    h.kick(0);
    assert_eq!(h.queues[0].avail_len(), 1);
    assert!(h.backend.submitted().is_empty());

    h.dev.drained_end();
    h.pump();
    assert_eq!(h.queues[0].avail_len(), 1);

    h.dev.drained_end();
    h.pump();
    assert_eq!(h.queues[0].avail_len(), 0);
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);

    // Unbalanced ends are ignored.
    h.dev.drained_end();
}

#[test]
fn drain_quiesces_a_running_dataplane() {
    let mut h = Harness::new(BlkConf::default());
    h.dev.start().unwrap();
    h.pump();
    h.backend.set_deferred(true);
    let first = h.add_read(0, 0, 512);
    h.kick(0);
    assert_eq!(h.backend.deferred_len(), 1);

    // Draining delivers what the backend holds and waits for it.
    h.dev.drained_begin();
    assert_eq!(h.status(&first), VIRTIO_BLK_S_OK);
    assert_eq!(h.dev.requests_in_flight(0), 0);

    h.backend.set_deferred(false);
    let second = h.add_read(0, 1, 512);
    h.kick(0);
    assert_eq!(h.status(&second), STATUS_UNSET);

    h.dev.drained_end();
    h.pump();
    assert!(h.dev.dataplane_started());
    assert_eq!(h.status(&second), VIRTIO_BLK_S_OK);
}

#[test]
fn stop_inside_a_drained_section() {
    let mut h = Harness::new(BlkConf::default());
    h.dev.start().unwrap();
    h.pump();
    let setup = h.transport.setup_calls();

    h.dev.drained_begin();
    h.dev.stop();
    assert!(!h.dev.dataplane_started());
    assert_eq!(h.transport.host_notifiers_assigned(), 0);
    assert!(!h.transport.guest_notifiers_assigned());

    // No autostart and no inline processing until the section ends.
    let w = h.add_write(0, 0, &pattern(7, 512));
    h.kick(0);
    assert_eq!(h.status(&w), STATUS_UNSET);
    assert_eq!(h.queues[0].avail_len(), 1);
    assert_eq!(h.transport.setup_calls(), setup);

    h.dev.drained_end();
    h.pump();
    assert!(h.dev.dataplane_started());
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);
    assert_eq!(h.dev.requests_in_flight(0), 0);
    assert_eq!(h.transport.host_notifiers_assigned(), 1);
}

#[test]
fn nested_drain_around_a_stop() {
    let mut h = Harness::new(BlkConf::default());
    h.dev.start().unwrap();
    h.pump();

    h.dev.drained_begin();
    h.dev.stop();
    h.dev.drained_begin();
    let w = h.add_write(0, 8, &pattern(8, 512));
    h.kick(0);

    h.dev.drained_end();
    h.pump();
    assert_eq!(h.status(&w), STATUS_UNSET);
    assert!(!h.dev.dataplane_started());

    h.dev.drained_end();
    h.pump();
    assert!(h.dev.dataplane_started());
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);
    assert_eq!(h.dev.requests_in_flight(0), 0);
    assert_eq!(h.queues[0].used().len(), 1);
}

#[test]
fn start_inside_a_drained_section_waits_for_its_end() {
    let mut h = Harness::new(BlkConf::default());
    h.dev.drained_begin();
    h.dev.start().unwrap();
    assert!(h.dev.dataplane_started());

    let w = h.add_write(0, 16, &pattern(9, 512));
    h.kick(0);
    assert_eq!(h.status(&w), STATUS_UNSET);

    h.dev.drained_end();
    h.pump();
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);
    assert_eq!(h.dev.requests_in_flight(0), 0);

    h.dev.stop();
    assert!(!h.dev.dataplane_started());
    assert_eq!(h.transport.host_notifiers_assigned(), 0);
}

#[test]
fn reset_drops_completions_of_requests_it_abandoned() {
    let mut h = Harness::new(BlkConf {
        ioeventfd: false,
        ..Default::default()
    });
    h.backend.set_deferred(true);
    let r = h.add_read(0, 0, 512);
    h.kick(0);
    assert_eq!(h.dev.requests_in_flight(0), 1);

    h.dev.reset();
    assert_eq!(h.dev.guest_features(), 0);
    h.backend.complete_deferred();
    h.pump();

    assert!(h.queues[0].used().is_empty());
    assert!(h.transport.interrupts().is_empty());
    assert_eq!(h.dev.requests_in_flight(0), 0);
    assert_eq!(h.status(&r), STATUS_UNSET);
}

#[test]
fn reset_empties_the_retry_list() {
    let mut h = Harness::new(BlkConf {
        ioeventfd: false,
        werror: BlockdevOnError::Stop,
        ..Default::default()
    });
    h.backend.fail_next(OpKind::Write, BackendError::Io, 1);
    h.add_write(0, 0, &pattern(5, 512));
    h.kick(0);
    assert_eq!(h.dev.retry_len(), 1);
    h.dev.reset();
    assert_eq!(h.dev.retry_len(), 0);

    h.dev.set_features(h.dev.device_features()).unwrap();
    h.dev.vm_state_change(true);
    h.pump();
    assert!(h.queues[0].used().is_empty());
}

#[test]
fn queues_run_on_their_bound_contexts() {
    let mut registry = IoThreadRegistry::new();
    registry.add_context("io0");
    registry.add_context("io1");
    let mut h = Harness::with_registry(
        BlkConf {
            num_queues: 2,
            iothread: IoThreadMapping::PerQueue(vec![
                IoThreadVqMapping {
                    iothread: "io0".into(),
                    vqs: Some(vec![0]),
                },
                IoThreadVqMapping {
                    iothread: "io1".into(),
                    vqs: Some(vec![1]),
                },
            ]),
            ..Default::default()
        },
        registry,
    );
    assert_ne!(h.dev.guest_features() & VIRTIO_BLK_F_MQ, 0);

    let a = h.add_write(0, 0, &pattern(1, 512));
    let b = h.add_write(1, 64, &pattern(2, 512));
    h.dev.handle_output(0);
    h.dev.handle_output(1);
    assert!(h.dev.dataplane_started());
    // Nothing runs until the bound contexts are pumped.
    assert_eq!(h.status(&a), STATUS_UNSET);
    assert!(h.registry.get("io0").unwrap().run_until_idle() > 0);
    assert_eq!(h.status(&a), VIRTIO_BLK_S_OK);
    assert_eq!(h.status(&b), STATUS_UNSET);
    h.registry.get("io1").unwrap().run_until_idle();
    assert_eq!(h.status(&b), VIRTIO_BLK_S_OK);

    // The backend follows the first queue's context.
    assert_eq!(h.backend.attached_context().as_deref(), Some("io0"));
    let mut interrupts = h.transport.interrupts();
    interrupts.sort_unstable();
    assert_eq!(interrupts, vec![0, 1]);

    // Rebinding is refused while the dataplane runs.
    let shared = IoThreadMapping::Shared("io1".into());
    assert_eq!(
        h.dev.set_iothread_mapping(&shared, &h.registry),
        Err(ConfigError::DeviceActive)
    );
    h.dev.stop();
    h.dev.set_iothread_mapping(&shared, &h.registry).unwrap();
    h.kick(0);
    assert_eq!(h.backend.attached_context().as_deref(), Some("io1"));
}

#[test]
fn requests_complete_on_an_iothread() {
    let mut registry = IoThreadRegistry::new();
    registry.spawn_iothread("worker").unwrap();
    let mut h = Harness::with_registry(
        BlkConf {
            num_queues: 2,
            iothread: IoThreadMapping::Shared("worker".into()),
            ..Default::default()
        },
        registry,
    );

    let data = pattern(6, 4096);
    let w = h.add_write(1, 16, &data);
    h.dev.handle_output(1);
    wait_until(|| h.used_len(1, &w).is_some());
    assert_eq!(h.status(&w), VIRTIO_BLK_S_OK);

    let r = h.add_read(0, 16, 4096);
    h.dev.handle_output(0);
    wait_until(|| h.used_len(0, &r).is_some());
    assert_eq!(h.guest_bytes(r.data_in[0], 4096), data);

    h.backend.set_deferred(true);
    let pending = h.add_read(0, 0, 512);
    h.dev.handle_output(0);
    wait_until(|| h.backend.deferred_len() == 1);
    h.dev.stop();
    assert_eq!(h.status(&pending), VIRTIO_BLK_S_OK);
    assert_eq!(h.dev.requests_in_flight(0), 0);
}
