//! Wi-Fi firmware version variants.
//!
//! A board configuration may declare independently versioned firmware families. Each family's
//! name appears in a firmware filename as a version token, and a newer major version ships under a
//! different token. For a filename template carrying the default tokens, every combination of
//! default/next tokens is a candidate; the candidates found on disk are flashed under a guard that
//! checks the version variables the bootloader exported.

use std::collections::BTreeMap;
use std::path::Path;

use crate::xml::Element;

/// One version axis: the two tokens a filename may carry and the guard each one implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAxis {
    pub default_token: String,
    pub next_token: String,
    pub default_guard: String,
    pub next_guard: String,
}

impl VersionAxis {
    /// Build the axis for firmware `fw` whose default major version is `version`.
    ///
    /// The family named like the SoC itself is checked through `soc_version_major`.
    pub fn new(fw: &str, version: u32, arch: &str) -> Self {
        let default_token = if version > 1 {
            format!("{fw}_v{version}")
        } else {
            fw.to_owned()
        };
        let next_token = format!("{fw}_v{}", version + 1);

        let var = if fw == arch { "soc" } else { fw };
        let default_guard = format!(
            "if test \"${var}_version_major\" = \"{version}\" || test \"${var}_version_major\" = \"\"; then "
        );
        let next_guard = format!(
            "if test \"${var}_version_major\" = \"{}\"; then ",
            version + 1
        );

        Self {
            default_token,
            next_token,
            default_guard,
            next_guard,
        }
    }

    /// (token, guard) candidates, default first.
    fn candidates(&self) -> [(&str, &str); 2] {
        [
            (self.default_token.as_str(), self.default_guard.as_str()),
            (self.next_token.as_str(), self.next_guard.as_str()),
        ]
    }
}

/// Parse the axes out of a `VERSION_PARAMETER` block.
///
/// `version_check` lists firmware names and `default_version` their default major versions, both
/// comma separated and of equal length.
pub fn parse_axes(block: &Element, arch: &str) -> anyhow::Result<Vec<VersionAxis>> {
    let names = block
        .find_text("version_check")
        .ok_or(anyhow::anyhow!("VERSION_PARAMETER has no version_check"))?;
    let versions = block
        .find_text("default_version")
        .ok_or(anyhow::anyhow!("VERSION_PARAMETER has no default_version"))?;

    let names: Vec<&str> = names.split(',').map(str::trim).collect();
    let versions = versions
        .split(',')
        .map(|v| v.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("invalid default_version: {e}"))?;

    anyhow::ensure!(
        names.len() == versions.len(),
        "invalid VERSION_PARAMETER: {} firmware names but {} default versions",
        names.len(),
        versions.len()
    );

    Ok(names
        .into_iter()
        .zip(versions)
        .map(|(fw, version)| VersionAxis::new(fw, version, arch))
        .collect())
}

/// Iterates over every combination of one item per list, the last list varying fastest.
///
/// With no lists the product has exactly one (empty) combination.
pub struct CartesianProduct<'a, T> {
    lists: &'a [Vec<T>],
    indices: Vec<usize>,
    done: bool,
}

impl<'a, T> CartesianProduct<'a, T> {
    pub fn new(lists: &'a [Vec<T>]) -> Self {
        Self {
            lists,
            indices: vec![0; lists.len()],
            done: lists.iter().any(Vec::is_empty),
        }
    }
}

impl<'a, T> Iterator for CartesianProduct<'a, T> {
    type Item = Vec<&'a T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let item = self
            .indices
            .iter()
            .zip(self.lists)
            .map(|(&i, list)| &list[i])
            .collect();

        // Advance like an odometer
        self.done = true;
        for (index, list) in self.indices.iter_mut().zip(self.lists).rev() {
            *index += 1;
            if *index < list.len() {
                self.done = false;
                break;
            }
            *index = 0;
        }

        Some(item)
    }
}

/// A firmware file found on disk, with the guard selecting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub filename: String,
    /// Concatenated `if ...; then` openers, one per axis
    pub guard: String,
    /// Number of `fi` needed to close `guard`
    pub depth: usize,
}

/// Resolves firmware filename templates into the variants present in the images directory.
///
/// Results are remembered for the whole run, keyed by template and by concrete filename.
#[derive(Debug, Default)]
pub struct VariantResolver {
    axes: Vec<VersionAxis>,
    templates: BTreeMap<String, Vec<String>>,
    variants: BTreeMap<String, Variant>,
}

impl VariantResolver {
    pub fn new(axes: Vec<VersionAxis>) -> Self {
        Self {
            axes,
            ..Default::default()
        }
    }

    /// Whether any version axis is configured.
    pub fn is_active(&self) -> bool {
        !self.axes.is_empty()
    }

    /// The candidate (filename, guard) pairs for a template, existing or not.
    pub fn candidates(&self, template: &str) -> Vec<(String, String)> {
        let lists: Vec<Vec<(&str, &str)>> =
            self.axes.iter().map(|a| a.candidates().to_vec()).collect();

        CartesianProduct::new(&lists)
            .map(|combination| {
                let mut filename = template.to_owned();
                let mut guard = String::new();
                for (axis, (token, axis_guard)) in self.axes.iter().zip(combination) {
                    filename = filename.replace(&axis.default_token, token);
                    guard.push_str(axis_guard);
                }
                (filename, guard)
            })
            .collect()
    }

    /// Resolve a template, keeping the candidates that exist under `images_dir`.
    pub fn resolve(&mut self, template: &str, images_dir: &Path) -> Vec<Variant> {
        if let Some(filenames) = self.templates.get(template) {
            return filenames
                .iter()
                .filter_map(|f| self.variants.get(f).cloned())
                .collect();
        }

        let depth = self.axes.len();
        let mut filenames = Vec::new();
        for (filename, guard) in self.candidates(template) {
            if filenames.contains(&filename) || !images_dir.join(&filename).exists() {
                continue;
            }

            log::debug!("firmware variant {filename} found for {template}");
            self.variants.entry(filename.clone()).or_insert(Variant {
                filename: filename.clone(),
                guard,
                depth,
            });
            filenames.push(filename);
        }

        let resolved = filenames
            .iter()
            .filter_map(|f| self.variants.get(f).cloned())
            .collect();
        self.templates.insert(template.to_owned(), filenames);
        resolved
    }
}

#[test]
fn test_axis_tokens() {
    let axis = VersionAxis::new("qcn9224", 1, "ipq5332");
    assert_eq!(axis.default_token, "qcn9224");
    assert_eq!(axis.next_token, "qcn9224_v2");
    assert_eq!(
        axis.default_guard,
        "if test \"$qcn9224_version_major\" = \"1\" || test \"$qcn9224_version_major\" = \"\"; then "
    );
    assert_eq!(
        axis.next_guard,
        "if test \"$qcn9224_version_major\" = \"2\"; then "
    );

    let soc = VersionAxis::new("ipq5332", 2, "ipq5332");
    assert_eq!(soc.default_token, "ipq5332_v2");
    assert_eq!(soc.next_token, "ipq5332_v3");
    assert!(soc.next_guard.contains("$soc_version_major"));
}

#[test]
fn test_parse_axes() -> anyhow::Result<()> {
    let block = Element::parse(
        "<data type=\"VERSION_PARAMETER\">\
         <version_check>ipq5332,qcn9224</version_check>\
         <default_version>1,1</default_version></data>",
    )?;
    let axes = parse_axes(&block, "ipq5332")?;
    assert_eq!(axes.len(), 2);
    assert_eq!(axes[1].next_token, "qcn9224_v2");

    let bad = Element::parse(
        "<data><version_check>a,b</version_check><default_version>1</default_version></data>",
    )?;
    assert!(parse_axes(&bad, "ipq5332").is_err());
    Ok(())
}

#[test]
fn test_cartesian_product() {
    let lists = vec![vec![1, 2], vec![3], vec![4, 5]];
    let combinations: Vec<Vec<i32>> = CartesianProduct::new(&lists)
        .map(|c| c.into_iter().copied().collect())
        .collect();
    assert_eq!(
        combinations,
        [vec![1, 3, 4], vec![1, 3, 5], vec![2, 3, 4], vec![2, 3, 5]]
    );

    let empty: Vec<Vec<i32>> = Vec::new();
    assert_eq!(CartesianProduct::new(&empty).count(), 1);
    assert_eq!(CartesianProduct::new(&[vec![1], vec![]]).count(), 0);
}

#[test]
fn test_resolve_two_axes() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let axes = vec![
        VersionAxis::new("ipq5332", 1, "ipq5332"),
        VersionAxis::new("qcn9224", 1, "ipq5332"),
    ];
    let mut resolver = VariantResolver::new(axes);

    let template = "ipq5332_qcn9224_wifi_fw-squashfs.img";
    let candidates = resolver.candidates(template);
    assert_eq!(candidates.len(), 4);

    for name in [
        "ipq5332_qcn9224_wifi_fw-squashfs.img",
        "ipq5332_v2_qcn9224_v2_wifi_fw-squashfs.img",
    ] {
        std::fs::write(dir.path().join(name), b"fw")?;
    }

    let variants = resolver.resolve(template, dir.path());
    assert_eq!(variants.len(), 2);
    for variant in &variants {
        assert_eq!(variant.depth, 2);
        assert_eq!(variant.guard.matches("if test").count(), 2);
        assert_eq!(variant.guard.matches("; then").count(), 2);
    }
    assert_eq!(variants[0].filename, template);
    assert!(variants[1].guard.contains("= \"2\"; then if test"));

    // Cached: files appearing later don't change the answer
    std::fs::write(dir.path().join("ipq5332_v2_qcn9224_wifi_fw-squashfs.img"), b"fw")?;
    assert_eq!(resolver.resolve(template, dir.path()), variants);

    Ok(())
}
