//! Devices the memory and process core needs: just the serial console.

pub mod serial;
