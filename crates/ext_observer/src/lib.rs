//! Image tracking for dimmer content scripts.
//!
//! A page may end up with several injected copies of the content script. The
//! [`InstanceMarker`] decides which copy owns the page; only that copy builds an
//! [`Observer`], so dynamically inserted images are dimmed exactly once.

mod image_observer;
mod instance;
mod observer;

pub use image_observer::ImageObserver;
pub use instance::{InstanceClaim, InstanceMarker, InstanceStatus, InstanceToken};
pub use observer::{
    collect_image_like, is_image_like, outermost_image_like, ImageCallback, Observer,
    ATTRIBUTE_FILTER,
};
