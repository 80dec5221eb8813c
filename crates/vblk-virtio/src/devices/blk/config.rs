use serde::{Deserialize, Serialize};
use thiserror::Error;
use vblk_storage::REQUEST_MAX_SECTORS;

use super::completion::{BlockdevOnError, ErrorPolicy};
use crate::context::{IoContext, IoThreadRegistry};

pub const VIRTIO_QUEUE_MAX: u16 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("num-queues property must be larger than 0")]
    NoQueues,

    #[error("num-queues property must be at most {max}")]
    TooManyQueues { max: u16 },

    #[error("invalid queue-size property ({0}), must be > 2")]
    QueueSizeTooSmall(u16),

    #[error("invalid queue-size property ({size}), must be a power of 2 and at most {max}")]
    QueueSizeInvalid { size: u16, max: u16 },

    #[error("queue-size property ({0}) must be at most 128 without seg-max-adjust")]
    SegMaxAdjust(u16),

    #[error("invalid {name} property ({value}), must be between 1 and {max}")]
    SectorLimit {
        name: &'static str,
        value: u32,
        max: u64,
    },

    #[error("iothread-vq-mapping must not be empty")]
    EmptyMapping,

    #[error("IOThread {0:?} not found")]
    UnknownIoThread(String),

    #[error("duplicate IOThread name {0:?} in iothread-vq-mapping")]
    DuplicateIoThread(String),

    #[error("iothread-vq-mapping vqs lists must be given for all IOThreads or none")]
    MixedVqLists,

    #[error("vq index {vq} for IOThread {iothread:?} must be less than num_queues {num_queues}")]
    VqOutOfRange {
        vq: u16,
        iothread: String,
        num_queues: u16,
    },

    #[error("cannot assign vq {0} to multiple IOThreads")]
    VqAssignedTwice(u16),

    #[error("missing vq {0} IOThread assignment")]
    VqUnassigned(u16),

    #[error("expected {expected} virtqueues, got {got}")]
    QueueCountMismatch { expected: u16, got: usize },

    #[error("iothread mapping can only change while the device is stopped")]
    DeviceActive,
}

/// One `iothread-vq-mapping` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoThreadVqMapping {
    pub iothread: String,
    #[serde(default)]
    pub vqs: Option<Vec<u16>>,
}

/// Where the device's queues run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoThreadMapping {
    /// Everything on the main loop.
    #[default]
    None,
    /// Every queue on one named context.
    Shared(String),
    /// Explicit per-queue assignment.
    PerQueue(Vec<IoThreadVqMapping>),
}

fn default_num_queues() -> u16 {
    1
}

fn default_queue_size() -> u16 {
    256
}

fn default_true() -> bool {
    true
}

fn default_discard_sectors() -> u32 {
    REQUEST_MAX_SECTORS as u32
}

/// User-facing virtio-blk properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BlkConf {
    #[serde(default = "default_num_queues")]
    pub num_queues: u16,
    #[serde(default = "default_queue_size")]
    pub queue_size: u16,
    pub iothread: IoThreadMapping,
    #[serde(default = "default_true")]
    pub request_merging: bool,
    #[serde(default = "default_true")]
    pub seg_max_adjust: bool,
    #[serde(default = "default_true")]
    pub config_wce: bool,
    /// Enables the dataplane path through host/guest notifiers.
    #[serde(default = "default_true")]
    pub ioeventfd: bool,
    #[serde(default = "default_true")]
    pub discard: bool,
    #[serde(default = "default_true")]
    pub write_zeroes: bool,
    pub scsi: bool,
    #[serde(default = "default_discard_sectors")]
    pub max_discard_sectors: u32,
    #[serde(default = "default_discard_sectors")]
    pub max_write_zeroes_sectors: u32,
    pub serial: Option<String>,
    /// Overrides the backend's write-cache mode at realize time.
    pub write_cache: Option<bool>,
    pub rerror: BlockdevOnError,
    pub werror: BlockdevOnError,
}

impl Default for BlkConf {
    fn default() -> Self {
        Self {
            num_queues: default_num_queues(),
            queue_size: default_queue_size(),
            iothread: IoThreadMapping::None,
            request_merging: true,
            seg_max_adjust: true,
            config_wce: true,
            ioeventfd: true,
            discard: true,
            write_zeroes: true,
            scsi: false,
            max_discard_sectors: default_discard_sectors(),
            max_write_zeroes_sectors: default_discard_sectors(),
            serial: None,
            write_cache: None,
            rerror: BlockdevOnError::Auto,
            werror: BlockdevOnError::Auto,
        }
    }
}

impl BlkConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_queues == 0 {
            return Err(ConfigError::NoQueues);
        }
        if self.num_queues > VIRTIO_QUEUE_MAX {
            return Err(ConfigError::TooManyQueues {
                max: VIRTIO_QUEUE_MAX,
            });
        }
        if self.queue_size <= 2 {
            return Err(ConfigError::QueueSizeTooSmall(self.queue_size));
        }
        if !self.queue_size.is_power_of_two() || self.queue_size > VIRTIO_QUEUE_MAX {
            return Err(ConfigError::QueueSizeInvalid {
                size: self.queue_size,
                max: VIRTIO_QUEUE_MAX,
            });
        }
        if !self.seg_max_adjust && self.queue_size > 128 {
            return Err(ConfigError::SegMaxAdjust(self.queue_size));
        }
        if self.discard {
            check_sector_limit("max-discard-sectors", self.max_discard_sectors)?;
        }
        if self.write_zeroes {
            check_sector_limit("max-write-zeroes-sectors", self.max_write_zeroes_sectors)?;
        }
        Ok(())
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy {
            rerror: self.rerror,
            werror: self.werror,
        }
    }

    /// Resolves the context each queue is bound to.
    pub fn resolve_contexts(
        &self,
        registry: &IoThreadRegistry,
    ) -> Result<Vec<IoContext>, ConfigError> {
        resolve_contexts(&self.iothread, self.num_queues, registry)
    }
}

fn check_sector_limit(name: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || u64::from(value) > REQUEST_MAX_SECTORS {
        return Err(ConfigError::SectorLimit {
            name,
            value,
            max: REQUEST_MAX_SECTORS,
        });
    }
    Ok(())
}

pub(crate) fn resolve_contexts(
    mapping: &IoThreadMapping,
    num_queues: u16,
    registry: &IoThreadRegistry,
) -> Result<Vec<IoContext>, ConfigError> {
    match mapping {
        IoThreadMapping::None => Ok(vec![registry.main_context().clone(); num_queues as usize]),
        IoThreadMapping::Shared(name) => {
            let ctx = registry
                .get(name)
                .ok_or_else(|| ConfigError::UnknownIoThread(name.clone()))?;
            Ok(vec![ctx; num_queues as usize])
        }
        IoThreadMapping::PerQueue(list) => {
            let owners = assign_vqs(list, num_queues, |name| registry.contains(name))?;
            owners
                .into_iter()
                .map(|i| {
                    let name = &list[i].iothread;
                    registry
                        .get(name)
                        .ok_or_else(|| ConfigError::UnknownIoThread(name.clone()))
                })
                .collect()
        }
    }
}

/// Validates an `iothread-vq-mapping` list and returns, for each queue, the index of the entry
/// that owns it.
pub fn assign_vqs(
    list: &[IoThreadVqMapping],
    num_queues: u16,
    exists: impl Fn(&str) -> bool,
) -> Result<Vec<usize>, ConfigError> {
    let Some(first) = list.first() else {
        return Err(ConfigError::EmptyMapping);
    };
    let has_lists = first.vqs.is_some();
    let mut owner: Vec<Option<usize>> = vec![None; num_queues as usize];

    for (i, entry) in list.iter().enumerate() {
        if !exists(&entry.iothread) {
            return Err(ConfigError::UnknownIoThread(entry.iothread.clone()));
        }
        if list[..i].iter().any(|e| e.iothread == entry.iothread) {
            return Err(ConfigError::DuplicateIoThread(entry.iothread.clone()));
        }
        if entry.vqs.is_some() != has_lists {
            return Err(ConfigError::MixedVqLists);
        }
        for &vq in entry.vqs.iter().flatten() {
            if vq >= num_queues {
                return Err(ConfigError::VqOutOfRange {
                    vq,
                    iothread: entry.iothread.clone(),
                    num_queues,
                });
            }
            let slot = &mut owner[vq as usize];
            if slot.is_some() {
                return Err(ConfigError::VqAssignedTwice(vq));
            }
            *slot = Some(i);
        }
    }

    if has_lists {
        owner
            .into_iter()
            .enumerate()
            .map(|(vq, o)| o.ok_or(ConfigError::VqUnassigned(vq as u16)))
            .collect()
    } else {
        Ok((0..num_queues as usize).map(|vq| vq % list.len()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, vqs: Option<&[u16]>) -> IoThreadVqMapping {
        IoThreadVqMapping {
            iothread: name.to_owned(),
            vqs: vqs.map(<[u16]>::to_vec),
        }
    }

    fn known(name: &str) -> bool {
        matches!(name, "a" | "b" | "c")
    }

    #[test]
    fn defaults_validate() {
        BlkConf::default().validate().unwrap();
    }

    #[test]
    fn queue_geometry_limits() {
        let conf = BlkConf {
            num_queues: 0,
            ..Default::default()
        };
        assert_eq!(conf.validate(), Err(ConfigError::NoQueues));
        let conf = BlkConf {
            queue_size: 2,
            ..Default::default()
        };
        assert_eq!(conf.validate(), Err(ConfigError::QueueSizeTooSmall(2)));
        let conf = BlkConf {
            queue_size: 100,
            ..Default::default()
        };
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::QueueSizeInvalid { size: 100, .. })
        ));
        let conf = BlkConf {
            max_discard_sectors: 0,
            ..Default::default()
        };
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::SectorLimit { name: "max-discard-sectors", .. })
        ));
        let conf = BlkConf {
            seg_max_adjust: false,
            ..Default::default()
        };
        assert_eq!(conf.validate(), Err(ConfigError::SegMaxAdjust(256)));
    }

    #[test]
    fn round_robin_without_vq_lists() {
        let list = [entry("a", None), entry("b", None)];
        assert_eq!(assign_vqs(&list, 5, known).unwrap(), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn explicit_lists_must_cover_every_queue_once() {
        let list = [entry("a", Some(&[0, 2])), entry("b", Some(&[1, 3]))];
        assert_eq!(assign_vqs(&list, 4, known).unwrap(), vec![0, 1, 0, 1]);

        let list = [entry("a", Some(&[0])), entry("b", Some(&[0, 1]))];
        assert_eq!(assign_vqs(&list, 2, known), Err(ConfigError::VqAssignedTwice(0)));

        let list = [entry("a", Some(&[0]))];
        assert_eq!(assign_vqs(&list, 2, known), Err(ConfigError::VqUnassigned(1)));

        let list = [entry("a", Some(&[4]))];
        assert!(matches!(
            assign_vqs(&list, 2, known),
            Err(ConfigError::VqOutOfRange { vq: 4, .. })
        ));
    }

    #[test]
    fn mapping_entries_are_checked() {
        let list = [entry("a", Some(&[0])), entry("b", None)];
        assert_eq!(assign_vqs(&list, 1, known), Err(ConfigError::MixedVqLists));

        let list = [entry("a", None), entry("a", None)];
        assert_eq!(
            assign_vqs(&list, 2, known),
            Err(ConfigError::DuplicateIoThread("a".into()))
        );

        let list = [entry("zz", None)];
        assert_eq!(
            assign_vqs(&list, 1, known),
            Err(ConfigError::UnknownIoThread("zz".into()))
        );
    }

    #[test]
    fn conf_deserializes_with_defaults() {
        let conf: BlkConf = serde_json::from_str(
            r#"{"num-queues": 4, "iothread": {"per-queue": [{"iothread": "a"}]}, "werror": "stop"}"#,
        )
        .unwrap();
        assert_eq!(conf.num_queues, 4);
        assert_eq!(conf.queue_size, 256);
        assert!(conf.request_merging);
        assert_eq!(conf.werror, BlockdevOnError::Stop);
        assert_eq!(conf.rerror, BlockdevOnError::Auto);
        assert_eq!(
            conf.iothread,
            IoThreadMapping::PerQueue(vec![entry("a", None)])
        );
    }

    #[test]
    fn shared_context_must_exist() {
        let mut reg = IoThreadRegistry::new();
        reg.add_context("a");
        let ctxs = resolve_contexts(&IoThreadMapping::Shared("a".into()), 3, &reg).unwrap();
        assert!(ctxs.iter().all(|c| c.name() == "a"));
        assert_eq!(
            resolve_contexts(&IoThreadMapping::Shared("x".into()), 1, &reg).unwrap_err(),
            ConfigError::UnknownIoThread("x".into())
        );
    }
}
