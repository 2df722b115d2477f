pub mod provisioner;

pub use provisioner::{ExecutableSource, Provisioner};
