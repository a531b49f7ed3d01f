//! Remembers what the converter last wrote for each foreign object
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
};
use vmop_core::{DynamicObject, ResourceKey};

/// What the mirror of one foreign object held when it was last confirmed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watermark {
    /// Resource version of the mirror after the confirming read or write
    pub mirror_version: String,
    /// [`digest`] of the translated native object
    pub digest: u64,
}

/// Digest of everything the converter writes to a native object
///
/// `serde_json` keeps object keys sorted, so equal content always hashes equally.
pub fn digest(native: &DynamicObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    native.spec().map(|spec| spec.to_string()).hash(&mut hasher);
    native.label_map().hash(&mut hasher);
    native.annotation_map().hash(&mut hasher);
    if let Some(owners) = &native.metadata.owner_references {
        for owner in owners {
            (&owner.kind, &owner.name, &owner.uid).hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Watermarks keyed by foreign object
#[derive(Debug, Default)]
pub struct Watermarks {
    marks: HashMap<ResourceKey, Watermark>,
}

impl Watermarks {
    /// Whether `mirror` is still the object that was confirmed to hold `digest`
    ///
    /// A missing mirror, or one changed by anyone since, is never current.
    pub fn is_current(&self, foreign: &ResourceKey, digest: u64, mirror: Option<&DynamicObject>) -> bool {
        let Some(version) = mirror.and_then(|mirror| mirror.metadata.resource_version.as_deref()) else {
            return false;
        };
        self.marks
            .get(foreign)
            .is_some_and(|mark| mark.digest == digest && mark.mirror_version == version)
    }

    /// Record that `mirror` holds `digest` for `foreign`
    ///
    /// Mirrors without a resource version are not recorded.
    pub fn record(&mut self, foreign: ResourceKey, digest: u64, mirror: &DynamicObject) {
        match &mirror.metadata.resource_version {
            Some(version) => {
                self.marks.insert(foreign, Watermark {
                    mirror_version: version.clone(),
                    digest,
                });
            }
            None => {
                self.marks.remove(&foreign);
            }
        }
    }

    /// Look up the watermark of `foreign`
    pub fn get(&self, foreign: &ResourceKey) -> Option<&Watermark> {
        self.marks.get(foreign)
    }

    /// Forget `foreign`
    pub fn forget(&mut self, foreign: &ResourceKey) -> Option<Watermark> {
        self.marks.remove(foreign)
    }

    /// Every foreign object with a watermark
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.marks.keys()
    }
}
