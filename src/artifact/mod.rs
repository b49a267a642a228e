//! Boot media building blocks.
//!
//! - [`cpio`] - Compressed cpio archives appended to an initrd
//! - [`embed`] - Fixed-capacity regions patched inside an unpacked ISO
//!   (ignition image, kernel argument placeholders)
//! - [`iso`] - ISO unpacking and repacking (trait + xorriso implementation)

pub mod cpio;
pub mod embed;
pub mod iso;
