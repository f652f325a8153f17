//! # Formats Module
//!
//! Binary encodings that cross a remote boundary.
//!
//! Only the link reference form is defined here. Moving the bytes is the
//! job of whoever calls these pure transformations.

mod reference;

pub use reference::*;
