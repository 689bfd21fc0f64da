//! The list of sub-images that go into the packed blob.

use std::fmt;

use crate::engine::BoardPlan;

/// The FIT image type a sub-image is declared with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageKind {
    Firmware,
    Script,
}

impl ImageKind {
    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Firmware => "firmware",
            ImageKind::Script => "script",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Sub-image name inside the blob
    pub label: String,
    /// File name, relative to the images directory
    pub filename: String,
    pub kind: ImageKind,
    /// Partition the image is written to, if the script flashes it
    pub target_partition: Option<String>,
}

/// Sub-image label and file name of the flashing script.
pub const SCRIPT_LABEL: &str = "script";
pub const SCRIPT_FILENAME: &str = "flash.scr";

/// An ordered, duplicate-free list of sub-images. The flashing script always comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    images: Vec<ImageDescriptor>,
}

impl Default for ImageManifest {
    fn default() -> Self {
        Self {
            images: vec![ImageDescriptor {
                label: SCRIPT_LABEL.into(),
                filename: SCRIPT_FILENAME.into(),
                kind: ImageKind::Script,
                target_partition: None,
            }],
        }
    }
}

impl ImageManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image unless one with the same label, file and kind is already listed.
    ///
    /// Returns whether it was added. A duplicate still records its target partition if the
    /// listed image had none.
    pub fn add(&mut self, image: ImageDescriptor) -> bool {
        let existing = self.images.iter_mut().find(|i| {
            i.label == image.label && i.filename == image.filename && i.kind == image.kind
        });
        if let Some(existing) = existing {
            if existing.target_partition.is_none() {
                existing.target_partition = image.target_partition;
            }
            return false;
        }

        self.images.push(image);
        true
    }

    /// Add every image a plan extracts.
    pub fn add_plan(&mut self, plan: &BoardPlan) {
        for (image, partition) in plan.images() {
            self.add(ImageDescriptor {
                label: image.packed_label(),
                filename: image.filename.clone(),
                kind: ImageKind::Firmware,
                target_partition: partition.map(str::to_owned),
            });
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageDescriptor> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[test]
fn test_manifest_dedup() {
    use crate::engine::{ImageRef, Step};
    use crate::flash::{DeviceKind, FlashDeviceInfo};

    let tz = ImageRef::new("tz", "tz.mbn");
    let plan = BoardPlan {
        device: FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024),
        soc_versions: Vec::new(),
        machids: Vec::new(),
        flashinit: Some("nand"),
        steps: vec![
            Step::MibibReload {
                image: Some(ImageRef::new("mibib", "mibib.bin")),
                device: FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024),
            },
            Step::Flash {
                image: tz.clone(),
                partition: "0:QSEE".into(),
            },
            Step::MachidGuard {
                machids: vec!["8060001".into()],
                steps: vec![Step::Flash {
                    image: tz.clone(),
                    partition: "0:QSEE_1".into(),
                }],
            },
        ],
        terminate: true,
    };

    let mut manifest = ImageManifest::new();
    manifest.add_plan(&plan);
    // A second pass over the same images adds nothing
    manifest.add_plan(&plan);

    let images: Vec<_> = manifest.iter().collect();
    assert_eq!(images.len(), 3);
    assert_eq!(images[0].label, "script");
    assert_eq!(images[0].kind, ImageKind::Script);
    assert_eq!(images[1].filename, "mibib.bin");
    assert_eq!(images[1].target_partition, None);
    assert_eq!(images[2].label, tz.packed_label());
    assert_eq!(images[2].target_partition.as_deref(), Some("0:QSEE"));
}
