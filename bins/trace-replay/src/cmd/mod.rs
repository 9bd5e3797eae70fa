pub mod buckets;
pub mod replay;
