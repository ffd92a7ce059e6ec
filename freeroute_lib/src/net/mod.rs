pub mod interfaces;

pub use interfaces::{list_interfaces, NetworkInterface};
