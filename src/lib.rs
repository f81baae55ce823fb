pub mod client;
pub mod config;
pub mod protocol;
pub mod stats;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;
