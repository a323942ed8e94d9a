//! Session backed by a real libvirt daemon through the `virt` bindings.
//!
//! Compiled only with the `libvirt` feature; system libvirt headers are
//! needed to build it.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::{LibvirtConnector, LibvirtSession};

/// Whether this build can talk to libvirt.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_availability_follows_feature() {
        assert_eq!(super::is_available(), cfg!(feature = "libvirt"));
    }
}
