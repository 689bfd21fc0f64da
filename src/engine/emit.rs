//! Rendering a [`BoardPlan`] into flashing script commands.

use crate::flash::DeviceKind;
use crate::script::FlashScript;

use super::{BoardPlan, Step};

/// Append the commands for `plan` to `script`.
pub fn emit(plan: &BoardPlan, script: &mut FlashScript) {
    soc_version_check(&plan.soc_versions, script);
    machid_check(&plan.machids, script);

    if let Some(target) = plan.flashinit {
        script.append(&format!("flashinit {target}"), true);
    }

    for step in &plan.steps {
        emit_step(step, script);
    }

    if plan.terminate {
        script.end();
    }
}

/// Refuse to run on a SoC revision the images weren't built for. Boards that don't report a
/// revision are let through.
fn soc_version_check(versions: &[u32], script: &mut FlashScript) {
    let Some((first, rest)) = versions.split_first() else {
        return;
    };

    script.append_raw("if test -n $soc_hw_version");
    script.append_raw("; then\n");
    script.append_raw(&format!("if test \"$soc_hw_version\" = \"{first:x}\" "));
    for version in rest {
        script.append_raw(&format!("|| test \"$soc_hw_version\" = \"{version:x}\" "));
    }
    script.append_raw("; then\n");
    script.append_raw("echo 'soc_hw_version : Validation success'\n");
    script.append_raw("else\n");
    script.append_raw("echo 'soc_hw_version : did not match, aborting upgrade'\n");
    script.append_raw("exit 1\n");
    script.append_raw("fi\n");
    script.append_raw("else\n");
    script.append_raw("echo 'soc_hw_version : unknown, skipping validation'\n");
    script.append_raw("fi\n");
}

/// Refuse to run on a machine the configuration doesn't know.
fn machid_check(machids: &[String], script: &mut FlashScript) {
    let Some((first, rest)) = machids.split_first() else {
        return;
    };

    script.append_raw(&format!("if test \"$machid\" = \"{first}\" "));
    for machid in rest {
        script.append_raw(&format!("|| test \"$machid\" = \"{machid}\" "));
    }
    script.append_raw("; then\n");
    script.append_raw("echo 'machid : Validation success'\n");
    script.append_raw("else\n");
    script.append_raw("echo 'machid : unknown, aborting upgrade'\n");
    script.append_raw("exit 1\n");
    script.append_raw("fi\n");
}

fn emit_step(step: &Step, script: &mut FlashScript) {
    match step {
        Step::Flash { image, partition } => {
            script.xtract_n_flash(&image.packed_label(), partition);
        }
        Step::MibibReload { image, device } => {
            if let Some(image) = image {
                script.imxtract(&image.packed_label());
            }
            let fl_type = if device.kind == DeviceKind::Nand { 0 } else { 1 };
            script.append(
                &format!(
                    "mibib_reload {fl_type:x} {:x} {:x} {:x}",
                    device.page_size, device.block_size, device.chip_size
                ),
                true,
            );
        }
        Step::DetectVersions => script.append("qcn_detect", false),
        Step::MachidGuard { machids, steps } => {
            match machids.as_slice() {
                [machid] => script.start_if("machid", machid),
                machids => script.start_if_or("machid", machids),
            }
            for step in steps {
                emit_step(step, script);
            }
            script.end_if();
        }
        Step::VersionGuard {
            guard,
            depth,
            steps,
        } => {
            script.append(guard, false);
            for step in steps {
                emit_step(step, script);
            }
            for _ in 0..*depth {
                script.end_if();
            }
        }
    }
}

#[cfg(test)]
fn test_plan(steps: Vec<Step>) -> BoardPlan {
    use crate::flash::FlashDeviceInfo;

    BoardPlan {
        device: FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024),
        soc_versions: Vec::new(),
        machids: Vec::new(),
        flashinit: Some("nand"),
        steps,
        terminate: true,
    }
}

#[test]
fn test_prologue() {
    let mut plan = test_plan(Vec::new());
    plan.soc_versions = vec![0x201A_0100];
    plan.machids = vec!["8060001".into(), "8060002".into()];
    plan.terminate = false;

    let mut script = FlashScript::new();
    emit(&plan, &mut script);
    assert_eq!(
        script.dumps(),
        "if test -n $soc_hw_version; then\n\
         if test \"$soc_hw_version\" = \"201a0100\" ; then\n\
         echo 'soc_hw_version : Validation success'\n\
         else\n\
         echo 'soc_hw_version : did not match, aborting upgrade'\n\
         exit 1\n\
         fi\n\
         else\n\
         echo 'soc_hw_version : unknown, skipping validation'\n\
         fi\n\
         if test \"$machid\" = \"8060001\" || test \"$machid\" = \"8060002\" ; then\n\
         echo 'machid : Validation success'\n\
         else\n\
         echo 'machid : unknown, aborting upgrade'\n\
         exit 1\n\
         fi\n\
         flashinit nand || exit 1\n"
    );
}

#[test]
fn test_steps() {
    use super::ImageRef;
    use crate::util::sha1_hex;

    let mibib = ImageRef::new("mibib", "mibib.bin");
    let device = test_plan(Vec::new()).device;
    let plan = test_plan(vec![
        Step::MibibReload {
            image: Some(mibib),
            device,
        },
        Step::DetectVersions,
        Step::MachidGuard {
            machids: vec!["8060001".into()],
            steps: vec![Step::VersionGuard {
                guard: "if a; then if b; then ".into(),
                depth: 2,
                steps: vec![Step::Flash {
                    image: ImageRef::new("wifi", "wifi.img"),
                    partition: "wifi_fw".into(),
                }],
            }],
        },
    ]);

    let mut script = FlashScript::new();
    emit(&plan, &mut script);
    assert_eq!(
        script.dumps(),
        format!(
            "flashinit nand || exit 1\n\
             imxtract $imgaddr mibib-{} || exit 1\n\
             mibib_reload 0 800 20000 8000000 || exit 1\n\
             qcn_detect\n\
             if test \"$machid\" = \"8060001\"; then\n\n\
             if a; then if b; then \n\
             xtract_n_flash $imgaddr wifi-{} wifi_fw || exit 1\n\
             fi\n\nfi\n\n\
             fi\n\n\
             exit 0\n\n",
            sha1_hex("mibib.bin"),
            sha1_hex("wifi.img")
        )
    );
}
