//! The U-Boot hush script that flashes the packed sub-images.

use std::fmt;

/// Where the script's command output currently goes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stdout {
    Serial,
    Nulldev,
}

impl Stdout {
    pub fn name(self) -> &'static str {
        match self {
            Stdout::Serial => "serial",
            Stdout::Nulldev => "nulldev",
        }
    }
}

impl fmt::Display for Stdout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An append-only script accumulator.
///
/// Nesting is not tracked: every `start_if*` must be paired with an `end_if` by the caller.
#[derive(Debug, Clone)]
pub struct FlashScript {
    chunks: Vec<String>,
    stdout: Stdout,
}

impl Default for FlashScript {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            stdout: Stdout::Serial,
        }
    }
}

impl FlashScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Fatal commands abort the script when they fail.
    pub fn append(&mut self, cmd: &str, fatal: bool) {
        if fatal {
            self.chunks.push(format!("{cmd} || exit 1\n"));
        } else {
            self.chunks.push(format!("{cmd}\n"));
        }
    }

    /// Add text verbatim, without a line terminator.
    pub fn append_raw(&mut self, text: &str) {
        self.chunks.push(text.to_owned());
    }

    pub fn redirect(&mut self, dev: Stdout) {
        if self.stdout == dev {
            return;
        }
        self.append(&format!("setenv stdout {dev}"), false);
        self.stdout = dev;
    }

    /// Extract sub-image `label` from the loaded blob and write it to `partition`.
    pub fn xtract_n_flash(&mut self, label: &str, partition: &str) {
        self.append(&format!("xtract_n_flash $imgaddr {label} {partition}"), true);
    }

    /// Extract sub-image `label` without flashing it.
    pub fn imxtract(&mut self, label: &str) {
        self.append(&format!("imxtract $imgaddr {label}"), true);
    }

    /// Print a message. Unless `verbose`, the message goes to the serial console and output is
    /// sent back to the null device afterwards.
    pub fn echo(&mut self, msg: &str, newline: bool, verbose: bool) {
        if !verbose {
            self.redirect(Stdout::Serial);
        }

        if newline {
            self.append(&format!("echo {msg}"), false);
        } else {
            self.append(&format!("echo \\\\c{msg}"), false);
        }

        if !verbose {
            self.redirect(Stdout::Nulldev);
        }
    }

    pub fn start_if(&mut self, var: &str, value: &str) {
        self.append(&format!("if test \"${var}\" = \"{value}\"; then\n"), false);
    }

    /// Open a conditional that holds when `var` equals any of `values`.
    pub fn start_if_or<S: AsRef<str>>(&mut self, var: &str, values: &[S]) {
        let tests: Vec<String> = values
            .iter()
            .map(|v| format!("test \"${var}\" = \"{}\"", v.as_ref()))
            .collect();
        self.append(&format!("if {}; then\n", tests.join(" || ")), false);
    }

    pub fn end_if(&mut self) {
        self.append("fi\n", false);
    }

    /// Mark the successful end of the script.
    pub fn end(&mut self) {
        self.append("exit 0\n", false);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dumps(&self) -> String {
        self.chunks.concat()
    }
}

#[test]
fn test_append_fatal() {
    let mut script = FlashScript::new();
    script.append("flashinit nand", true);
    script.append("qcn_detect", false);
    script.xtract_n_flash("tz-abc", "0:QSEE");
    assert_eq!(
        script.dumps(),
        "flashinit nand || exit 1\nqcn_detect\nxtract_n_flash $imgaddr tz-abc 0:QSEE || exit 1\n"
    );
}

#[test]
fn test_redirect_dedup() {
    let mut script = FlashScript::new();
    script.redirect(Stdout::Serial);
    assert!(script.is_empty());

    script.echo("Flashing", false, false);
    script.echo("done", true, false);
    assert_eq!(
        script.dumps(),
        "echo \\\\cFlashing\nsetenv stdout nulldev\nsetenv stdout serial\necho done\nsetenv stdout nulldev\n"
    );

    let mut verbose = FlashScript::new();
    verbose.echo("hello", true, true);
    assert_eq!(verbose.dumps(), "echo hello\n");
}

#[test]
fn test_conditionals() {
    let mut script = FlashScript::new();
    script.start_if("machid", "8060001");
    script.end_if();
    script.start_if_or("machid", &["8060001", "8060002"]);
    script.end_if();
    script.end();
    assert_eq!(
        script.dumps(),
        "if test \"$machid\" = \"8060001\"; then\n\nfi\n\n\
         if test \"$machid\" = \"8060001\" || test \"$machid\" = \"8060002\"; then\n\nfi\n\n\
         exit 0\n\n"
    );
}
