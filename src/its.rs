//! Image tree source (`.its`) for `mkimage -f`.

use std::fmt::Write;

use crate::flash::FlashDeviceInfo;
use crate::manifest::{ImageDescriptor, ImageManifest};

const INDENT: &str = "        ";

/// The `.its` describing every image in `manifest`, for a blob flashed onto `device`.
pub fn render(manifest: &ImageManifest, device: &FlashDeviceInfo) -> String {
    let mut images = String::new();
    for image in manifest.iter() {
        render_image(&mut images, image);
    }

    format!(
        "\n/dts-v1/;\n\n/ {{\n{INDENT}description = \"Flashing {} {:x} {:x}\";\n{INDENT}images {{\n{images}\n{INDENT}}};\n}};\n",
        device.kind, device.page_size, device.block_size
    )
}

fn render_image(out: &mut String, image: &ImageDescriptor) {
    let fname = image.filename.replace('\\', "\\\\");
    let node = INDENT.repeat(2);
    let prop = INDENT.repeat(3);

    // Writing into a String can't fail
    let _ = write!(
        out,
        "\n{node}{label} {{\n\
         {prop}description = \"{fname}\";\n\
         {prop}data = /incbin/(\"./{fname}\");\n\
         {prop}type = \"{kind}\";\n\
         {prop}arch = \"arm\";\n\
         {prop}compression = \"none\";\n\
         {prop}hash@1 {{ algo = \"crc32\"; }};\n\
         {node}}};\n",
        label = image.label,
        kind = image.kind,
    );
}

#[test]
fn test_render() {
    use crate::flash::DeviceKind;
    use crate::manifest::ImageKind;

    let mut manifest = ImageManifest::new();
    manifest.add(ImageDescriptor {
        label: "tz-abc".into(),
        filename: "dir\\tz.mbn".into(),
        kind: ImageKind::Firmware,
        target_partition: Some("0:QSEE".into()),
    });

    let device = FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024);
    let its = render(&manifest, &device);

    assert!(its.starts_with("\n/dts-v1/;\n\n/ {\n        description = \"Flashing nand 800 20000\";\n"));
    assert!(its.ends_with("                };\n\n        };\n};\n"));
    assert!(its.contains(
        "\n                script {\n                        description = \"flash.scr\";\n"
    ));
    assert!(its.contains("data = /incbin/(\"./dir\\\\tz.mbn\");"));
    assert!(its.contains("type = \"firmware\";"));
    assert_eq!(its.matches("hash@1 { algo = \"crc32\"; };").count(), 2);
    assert!(its.find("script {").unwrap() < its.find("tz-abc {").unwrap());
}
