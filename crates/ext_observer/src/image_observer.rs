use ext_brightness::{apply_brightness, BrightnessValue};
use ext_dom::{DomError, SharedDocument};
use tracing::debug;

use crate::{InstanceClaim, InstanceStatus, Observer};

/// Applies the current brightness to image-like nodes as they appear.
///
/// Built disabled for [`InstanceStatus::ExistingForeign`] instances: every
/// operation is then a no-op and no native observer is ever created.
#[derive(Debug)]
pub struct ImageObserver {
    observer: Option<Observer>,
    brightness: BrightnessValue,
    status: InstanceStatus,
}

impl ImageObserver {
    pub fn new(document: SharedDocument, claim: &InstanceClaim) -> Self {
        let observer = if claim.is_authoritative() {
            let root = document.borrow().root();
            Some(Observer::new(document, root))
        } else {
            debug!(token = %claim.token, "image_observer disabled, page owned by another instance");
            None
        };

        Self {
            observer,
            brightness: BrightnessValue::default(),
            status: claim.status,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_disabled(&self) -> bool {
        self.observer.is_none()
    }

    pub fn brightness(&self) -> BrightnessValue {
        self.brightness
    }

    /// Brightness used by the next [`watch`](Self::watch).
    pub fn set_brightness(&mut self, value: BrightnessValue) -> &mut Self {
        self.brightness = value;
        self
    }

    pub fn is_watching(&self) -> bool {
        self.observer.as_ref().is_some_and(Observer::is_attached)
    }

    pub fn watch(&mut self) -> Result<(), DomError> {
        match self.observer.as_mut() {
            Some(observer) => observer.observe(Box::new(apply_brightness(self.brightness))),
            None => Ok(()),
        }
    }

    pub fn unwatch(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.disconnect();
        }
    }

    /// Process queued mutations. Returns the number of images touched.
    pub fn deliver(&mut self) -> usize {
        self.observer.as_mut().map_or(0, Observer::deliver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceMarker, InstanceToken};
    use ext_dom::{Document, NodeSpec};

    fn claimed(token: u8) -> (SharedDocument, InstanceClaim) {
        let document = Document::new("example.com").into_shared();
        let claim = InstanceMarker::with_token("chrome-dimmer", InstanceToken::from_bytes([token; 16]))
            .acquire(&mut document.borrow_mut())
            .unwrap();
        (document, claim)
    }

    #[test]
    fn test_watch_dims_inserted_images() {
        let (document, claim) = claimed(1);
        let mut images = ImageObserver::new(document.clone(), &claim);
        images.set_brightness(BrightnessValue::new(40.0)).watch().unwrap();
        assert!(images.is_watching());

        let img = {
            let mut doc = document.borrow_mut();
            let body = doc.body();
            doc.append_spec(body, &NodeSpec::element("img")).unwrap()
        };
        assert_eq!(images.deliver(), 1);
        assert_eq!(document.borrow().inline_style(img, "filter"), "brightness(40%)");

        // our own style write is not observed
        assert_eq!(images.deliver(), 0);
    }

    #[test]
    fn test_rewatch_uses_new_brightness() {
        let (document, claim) = claimed(1);
        let mut images = ImageObserver::new(document.clone(), &claim);
        images.set_brightness(BrightnessValue::new(40.0)).watch().unwrap();
        images.set_brightness(BrightnessValue::new(70.0)).watch().unwrap();
        assert_eq!(document.borrow().created_observer_count(), 1);

        let img = {
            let mut doc = document.borrow_mut();
            let body = doc.body();
            doc.append_spec(body, &NodeSpec::element("img")).unwrap()
        };
        images.deliver();
        assert_eq!(document.borrow().inline_style(img, "filter"), "brightness(70%)");
    }

    #[test]
    fn test_unwatch_stops_dimming() {
        let (document, claim) = claimed(1);
        let mut images = ImageObserver::new(document.clone(), &claim);
        images.watch().unwrap();
        images.unwatch();
        images.unwatch();
        assert!(!images.is_watching());

        let img = {
            let mut doc = document.borrow_mut();
            let body = doc.body();
            doc.append_spec(body, &NodeSpec::element("img")).unwrap()
        };
        assert_eq!(images.deliver(), 0);
        assert_eq!(document.borrow().inline_style(img, "filter"), "");
    }

    #[test]
    fn test_foreign_instance_never_observes() {
        let (document, _) = claimed(1);
        let claim = InstanceMarker::with_token("chrome-dimmer", InstanceToken::from_bytes([2; 16]))
            .acquire(&mut document.borrow_mut())
            .unwrap();
        let mut images = ImageObserver::new(document.clone(), &claim);
        assert!(images.is_disabled());
        assert_eq!(images.status(), InstanceStatus::ExistingForeign);

        images.set_brightness(BrightnessValue::new(10.0)).watch().unwrap();
        assert!(!images.is_watching());
        assert_eq!(document.borrow().created_observer_count(), 0);

        let img = {
            let mut doc = document.borrow_mut();
            let body = doc.body();
            doc.append_spec(body, &NodeSpec::element("img")).unwrap()
        };
        assert_eq!(images.deliver(), 0);
        assert_eq!(document.borrow().inline_style(img, "filter"), "");
    }
}
