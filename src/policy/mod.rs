//! Access policy: quota arithmetic and the validity checker.

pub mod quota;
pub mod validity;
