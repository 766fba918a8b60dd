use ext_dom::{Document, DomError, NodeId};
use rand::RngCore;
use std::fmt;
use tracing::debug;

/// Random 128-bit identity of one content-script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceToken([u8; 16]);

impl InstanceToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// No marker existed; this instance inserted one.
    New,
    /// The marker carries this instance's token.
    ExistingOwn,
    /// Another instance got there first and owns observation.
    ExistingForeign,
}

impl InstanceStatus {
    /// Whether this instance may observe and write brightness.
    pub fn is_authoritative(self) -> bool {
        !matches!(self, InstanceStatus::ExistingForeign)
    }
}

/// Outcome of [`InstanceMarker::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceClaim {
    pub status: InstanceStatus,
    /// Token stored in the document's marker.
    pub token: String,
    pub marker: NodeId,
}

impl InstanceClaim {
    pub fn is_authoritative(&self) -> bool {
        self.status.is_authoritative()
    }
}

/// `<meta name="{name}" content="{token}">` in `<head>`, one per document.
#[derive(Debug, Clone)]
pub struct InstanceMarker {
    name: String,
    token: InstanceToken,
}

impl InstanceMarker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, InstanceToken::generate())
    }

    pub fn with_token(name: impl Into<String>, token: InstanceToken) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> InstanceToken {
        self.token
    }

    /// Find or insert the marker for this document.
    pub fn acquire(&self, doc: &mut Document) -> Result<InstanceClaim, DomError> {
        let own = self.token.to_string();

        if let Some(marker) = doc.find_meta(&self.name) {
            let token = doc.attribute(marker, "content").unwrap_or_default().to_string();
            let status = if token == own {
                InstanceStatus::ExistingOwn
            } else {
                InstanceStatus::ExistingForeign
            };
            debug!(name = %self.name, status = ?status, "instance.acquire");
            return Ok(InstanceClaim {
                status,
                token,
                marker,
            });
        }

        let marker = doc.create_element("meta");
        doc.set_attribute(marker, "name", &self.name)?;
        doc.set_attribute(marker, "content", &own)?;
        let head = doc.head();
        doc.append_child(head, marker)?;
        debug!(name = %self.name, token = %own, "instance.acquire created marker");

        Ok(InstanceClaim {
            status: InstanceStatus::New,
            token: own,
            marker,
        })
    }
}
