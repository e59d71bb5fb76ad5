//! Accessory identity types shared by the channel and the event bus

use std::fmt;

/// Opaque handle for a physically attached accessory
///
/// The platform assigns `id` and owns the descriptive metadata. The core only
/// compares, hashes and clones handles; it never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessoryHandle {
    /// Platform-assigned identifier
    pub id: u32,
    /// Manufacturer string reported by the accessory
    pub manufacturer: String,
    /// Model string reported by the accessory
    pub model: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub serial: Option<String>,
}

impl AccessoryHandle {
    /// Create a handle with only the mandatory fields set
    pub fn new(id: u32, manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id,
            manufacturer: manufacturer.into(),
            model: model.into(),
            description: None,
            version: None,
            serial: None,
        }
    }

    /// Short name used for reader thread names and log lines
    pub fn name(&self) -> String {
        let name: String = format!("{}-{}", self.manufacturer, self.model)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        if name.trim_matches('-').is_empty() {
            format!("accessory-{}", self.id)
        } else {
            name
        }
    }
}

impl fmt::Display for AccessoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (#{})", self.manufacturer, self.model, self.id)?;
        if let Some(serial) = &self.serial {
            write!(f, " [{}]", serial)?;
        }
        Ok(())
    }
}
