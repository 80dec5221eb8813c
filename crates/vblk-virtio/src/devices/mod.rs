pub mod blk;
