//! Parameter helpers for step implementations.
//!
//! Parameters are looked up on the step first, then on the package, then
//! fall back to a caller default. Values go through template resolution
//! (see [`crate::template`]) against a lookup built from:
//!
//! | key              | value                                   |
//! |------------------|-----------------------------------------|
//! | package params   | every `parameter-*` package property    |
//! | `_uploaded_file` | the original file name, or empty        |
//! | `_package_id`    | the package id                          |
//! | step params      | the step's static parameters (win)      |
//! | `_input`         | the step's effective input, or empty    |
//!
//! The number of resolution passes comes from the `dynamic-param-max-cycle`
//! parameter (default 2).

use std::collections::HashMap;
use std::path::PathBuf;

use oxpipe_store::{ORIGINAL_PROPERTY, PackageData};

use crate::step::StepInfo;
use crate::template::{self, DEFAULT_MAX_CYCLES};

/// Parameter controlling the number of template resolution passes.
pub const MAX_CYCLE_PARAMETER: &str = "dynamic-param-max-cycle";

/// Parameter overriding a step's input path.
pub const INPUT_PARAMETER: &str = "input";

/// Parameter overriding a step's output path.
pub const OUTPUT_PARAMETER: &str = "output";

/// Parameter access for one step invocation.
#[derive(Debug, Clone, Copy)]
pub struct StepParameters<'a> {
    package: &'a PackageData,
    info: &'a StepInfo,
}

impl<'a> StepParameters<'a> {
    pub fn new(package: &'a PackageData, info: &'a StepInfo) -> Self {
        Self { package, info }
    }

    /// Step parameter, else package parameter, else `fallback`; unresolved.
    ///
    /// Blank values count as absent.
    pub fn raw(&self, name: &str, fallback: Option<&str>) -> Option<String> {
        self.info
            .parameter(name)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.package.parameter(name).filter(|v| !v.trim().is_empty()))
            .or(fallback)
            .map(str::to_string)
    }

    /// Like [`raw`](Self::raw), with templates resolved.
    pub fn get(&self, name: &str, fallback: Option<&str>) -> Option<String> {
        self.raw(name, fallback).map(|value| self.resolve(&value))
    }

    /// Resolved parameter or `fallback`.
    pub fn get_or(&self, name: &str, fallback: &str) -> String {
        self.get(name, Some(fallback)).unwrap_or_default()
    }

    /// Integer parameter; unparseable values yield `fallback`.
    pub fn int(&self, name: &str, fallback: i32) -> i32 {
        self.get(name, None)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(fallback)
    }

    /// Integer parameter without template resolution.
    pub fn int_raw(&self, name: &str, fallback: i32) -> i32 {
        self.raw(name, None)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(fallback)
    }

    /// 64-bit integer parameter; unparseable values yield `fallback`.
    pub fn long(&self, name: &str, fallback: i64) -> i64 {
        self.get(name, None)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(fallback)
    }

    /// First non-blank character of the parameter, or `fallback`.
    pub fn char(&self, name: &str, fallback: char) -> char {
        self.get(name, None)
            .and_then(|v| v.trim().chars().next())
            .unwrap_or(fallback)
    }

    /// The lookup map used for template resolution.
    pub fn lookup(&self) -> HashMap<String, String> {
        let mut values: HashMap<String, String> = self.package.parameters().into_iter().collect();
        values.insert(
            "_uploaded_file".to_string(),
            self.package.property_or(ORIGINAL_PROPERTY, "").to_string(),
        );
        values.insert("_package_id".to_string(), self.package.id().to_string());
        for (name, value) in self.info.parameters() {
            values.insert(name.clone(), value.clone());
        }
        values.insert(
            "_input".to_string(),
            self.info.input().unwrap_or_default().to_string(),
        );
        values
    }

    /// Resolve templates in `value`.
    pub fn resolve(&self, value: &str) -> String {
        let cycles = usize::try_from(self.int_raw(MAX_CYCLE_PARAMETER, DEFAULT_MAX_CYCLES as i32))
            .unwrap_or(0);
        template::resolve(value, Some(&self.lookup()), cycles)
    }

    /// Input file: the `input` parameter or the step's effective input,
    /// resolved inside the package. Globs resolve to their first match.
    pub fn input(&self) -> Option<PathBuf> {
        let input = self.raw(INPUT_PARAMETER, self.info.input())?;
        self.package.get_file(&self.resolve(&input))
    }

    /// Output location: the `output` parameter or the step's declared output,
    /// otherwise the input's parent directory, otherwise the package directory.
    pub fn output(&self, input: Option<&std::path::Path>) -> Option<PathBuf> {
        match self.raw(OUTPUT_PARAMETER, self.info.output()) {
            Some(output) => self.package.get_file(&self.resolve(&output)),
            None => Some(
                input
                    .and_then(|i| i.parent())
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| self.package.directory().to_path_buf()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxpipe_store::PackageStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PackageData) {
        let tmp = TempDir::new().unwrap();
        let store = PackageStore::new(tmp.path().join("packages")).unwrap();
        let source = tmp.path().join("upload.xml");
        std::fs::write(&source, "<doc/>").unwrap();
        let package = store.new_package("demo", Some(&source)).unwrap();
        (tmp, package)
    }

    fn info(params: &[(&str, &str)], input: Option<&str>, output: Option<&str>) -> StepInfo {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StepInfo::new(
            "s1",
            "Step",
            input.map(str::to_string),
            output.map(str::to_string),
            params,
        )
    }

    #[test]
    fn test_step_wins_over_package() {
        let (_tmp, mut package) = setup();
        package.set_parameter("lang", "fr");
        package.set_parameter("only-package", "p");
        let info = info(&[("lang", "en"), ("blank", "  ")], None, None);
        let params = StepParameters::new(&package, &info);

        assert_eq!(params.get("lang", None).as_deref(), Some("en"));
        assert_eq!(params.get("only-package", None).as_deref(), Some("p"));
        assert_eq!(params.get("blank", Some("fb")).as_deref(), Some("fb"));
        assert_eq!(params.get("missing", None), None);
        assert_eq!(params.get_or("missing", "x"), "x");
    }

    #[test]
    fn test_dynamic_values() {
        let (_tmp, mut package) = setup();
        package.set_parameter("root", "data");
        let info = info(&[("target", "/{root}/{_uploaded_file}")], Some("upload.xml"), None);
        let params = StepParameters::new(&package, &info);

        assert_eq!(params.get("target", None).as_deref(), Some("/data/upload.xml"));
        assert_eq!(params.resolve("{_package_id}"), package.id());
        assert_eq!(params.resolve("{_input}"), "upload.xml");
    }

    #[test]
    fn test_max_cycle_parameter() {
        let (_tmp, package) = setup();
        let two = info(&[("x", "{y}"), ("y", "v")], None, None);
        assert_eq!(StepParameters::new(&package, &two).resolve("{x}"), "v");

        let one = info(
            &[("x", "{y}"), ("y", "v"), (MAX_CYCLE_PARAMETER, "1")],
            None,
            None,
        );
        assert_eq!(StepParameters::new(&package, &one).resolve("{x}"), "{y}");

        let negative = info(
            &[("x", "{y}"), ("y", "v"), (MAX_CYCLE_PARAMETER, "-3")],
            None,
            None,
        );
        assert_eq!(StepParameters::new(&package, &negative).resolve("{x}"), "{y}");
    }

    #[test]
    fn test_typed_getters() {
        let (_tmp, package) = setup();
        let info = info(
            &[("n", " 42 "), ("big", "9000000000"), ("bad", "x1"), ("sep", " ;,")],
            None,
            None,
        );
        let params = StepParameters::new(&package, &info);
        assert_eq!(params.int("n", 0), 42);
        assert_eq!(params.int("bad", 7), 7);
        assert_eq!(params.int("missing", 3), 3);
        assert_eq!(params.long("big", 0), 9_000_000_000);
        assert_eq!(params.char("sep", ','), ';');
        assert_eq!(params.char("missing", ','), ',');
    }

    #[test]
    fn test_input_and_output() {
        let (_tmp, package) = setup();
        let info = info(&[], Some("upload.xml"), None);
        let params = StepParameters::new(&package, &info);

        let input = params.input().unwrap();
        assert_eq!(input, package.directory().join("upload.xml"));
        assert_eq!(params.output(Some(&input)), Some(package.directory().to_path_buf()));
        assert_eq!(params.output(None), Some(package.directory().to_path_buf()));
    }

    #[test]
    fn test_input_output_parameters_override() {
        let (_tmp, mut package) = setup();
        package.set_parameter("dir", "out");
        let info = info(
            &[("input", "*.xml"), ("output", "{dir}/result.xml")],
            Some("other.xml"),
            None,
        );
        let params = StepParameters::new(&package, &info);

        assert_eq!(params.input(), Some(package.directory().join("upload.xml")));
        assert_eq!(params.output(None), Some(package.directory().join("out/result.xml")));
    }

    #[test]
    fn test_no_input() {
        let (_tmp, package) = setup();
        let info = info(&[], None, None);
        assert_eq!(StepParameters::new(&package, &info).input(), None);
    }
}
