use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use renderer::{MemoryStore, RenderConfig, Renderer};

use crate::data::{overlay, table_to_runtime};

const FIXTURE_SUFFIX: &str = ".test.ss";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    /// Human-readable test description.
    #[serde(default)]
    pub description: Option<String>,

    /// Render configuration. Defaults apply to omitted fields.
    #[serde(default)]
    pub config: RenderConfig,

    /// Root data record.
    #[serde(default)]
    pub data: toml::Table,

    /// One render per entry, each overlaid on `data`, all sharing one store.
    /// Empty means a single render of `data`.
    #[serde(default)]
    pub passes: Vec<toml::Table>,

    /// Expected output of every pass (trimmed comparison).
    #[serde(default)]
    pub expect_output: Option<String>,

    /// Expected output per pass, in order (trimmed comparison).
    #[serde(default)]
    pub expect_outputs: Option<Vec<String>>,

    /// Expected render error; the error's Display string must contain this substring.
    #[serde(default)]
    pub expect_error: Option<String>,

    /// If true, the test expects compilation (parse or flatten) to fail.
    #[serde(default)]
    pub expect_compile_error: bool,

    /// Expected flattened regions, as printed by `sst render --regions`.
    #[serde(default)]
    pub expect_regions: Option<Vec<String>>,

    /// Expected total store reads across all passes.
    #[serde(default)]
    pub expect_store_gets: Option<usize>,
}

/// Parse a `.test.ss` file into its TOML config and template source.
fn parse_test_file(content: &str) -> Result<(TestConfig, &str), String> {
    let content = content.trim_start_matches('\u{feff}');

    if !content.starts_with("---") {
        return Err("missing opening --- frontmatter delimiter".into());
    }

    let after_open = &content[3..];
    let after_open = after_open
        .strip_prefix('\n')
        .or_else(|| after_open.strip_prefix("\r\n"))
        .unwrap_or(after_open);

    let close_pos = after_open
        .find("\n---")
        .ok_or("missing closing --- frontmatter delimiter")?;

    let toml_str = after_open[..close_pos].trim_end_matches('\r');
    let rest_start = close_pos + 4; // skip \n---
    let source = after_open[rest_start..]
        .strip_prefix("\r\n")
        .or_else(|| after_open[rest_start..].strip_prefix('\n'))
        .unwrap_or(&after_open[rest_start..]);

    let config: TestConfig = toml::from_str(toml_str).map_err(|e| format!("TOML parse error: {}", e))?;

    Ok((config, source))
}

pub enum TestOutcome {
    Pass,
    Fail(String),
}

pub struct TestResult {
    pub path: PathBuf,
    pub description: Option<String>,
    pub outcome: TestOutcome,
}

fn run_single_test(path: &Path) -> TestResult {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            return TestResult {
                path: path.to_path_buf(),
                description: None,
                outcome: TestOutcome::Fail(format!("cannot read file: {}", e)),
            };
        }
    };

    let (config, source) = match parse_test_file(&content) {
        Ok(pair) => pair,
        Err(e) => {
            return TestResult {
                path: path.to_path_buf(),
                description: None,
                outcome: TestOutcome::Fail(format!("frontmatter error: {}", e)),
            };
        }
    };

    let description = config.description.clone();
    let outcome = match check(&config, source) {
        Ok(()) => TestOutcome::Pass,
        Err(reason) => TestOutcome::Fail(reason),
    };
    TestResult {
        path: path.to_path_buf(),
        description,
        outcome,
    }
}

/// Compile and render one fixture. Returns the first mismatch.
fn check(config: &TestConfig, source: &str) -> Result<(), String> {
    let compiled = sstemplate::compile(source, 0);

    if config.expect_compile_error {
        return match compiled {
            Err(_) => Ok(()),
            Ok(_) => Err("expected compile error, but compilation succeeded".into()),
        };
    }

    let template = compiled.map_err(|errs| {
        let msgs: Vec<String> = errs.iter().map(|e| e.message.clone()).collect();
        format!("unexpected compile error: {}", msgs.join("; "))
    })?;

    if let Some(expected) = &config.expect_regions {
        let actual: Vec<String> = template.regions.iter().map(|r| r.to_string()).collect();
        if &actual != expected {
            return Err(format!(
                "region mismatch\n  expected: {:?}\n  actual:   {:?}",
                expected, actual
            ));
        }
    }

    let renderer = Renderer::new(config.config.clone(), Arc::new(MemoryStore::new()))
        .map_err(|e| format!("invalid config: {}", e))?;

    let passes: Vec<toml::Table> = if config.passes.is_empty() {
        vec![config.data.clone()]
    } else {
        config.passes.iter().map(|p| overlay(&config.data, p)).collect()
    };

    let mut outputs = Vec::with_capacity(passes.len());
    let mut store_gets = 0;
    for (i, pass) in passes.iter().enumerate() {
        match (renderer.render(&template, table_to_runtime(pass)), &config.expect_error) {
            (Ok(output), _) => {
                store_gets += output.stats.store_gets;
                outputs.push(output.text);
            }
            (Err(err), Some(expected)) => {
                let err_str = err.to_string();
                return if err_str.contains(expected.as_str()) {
                    Ok(())
                } else {
                    Err(format!(
                        "expected error containing \"{}\", got: {}",
                        expected, err_str
                    ))
                };
            }
            (Err(err), None) => return Err(format!("pass {}: unexpected render error: {}", i + 1, err)),
        }
    }

    if let Some(expected) = &config.expect_error {
        return Err(format!(
            "expected error containing \"{}\", but rendering succeeded",
            expected
        ));
    }

    if let Some(expected) = &config.expect_output {
        for (i, actual) in outputs.iter().enumerate() {
            if actual.trim() != expected.trim() {
                return Err(format!(
                    "pass {}: output mismatch\n  expected: {}\n  actual:   {}",
                    i + 1,
                    expected.trim(),
                    actual.trim()
                ));
            }
        }
    }

    if let Some(expected) = &config.expect_outputs {
        if expected.len() != outputs.len() {
            return Err(format!(
                "expected {} output(s), rendered {} pass(es)",
                expected.len(),
                outputs.len()
            ));
        }
        for (i, (actual, expected)) in outputs.iter().zip(expected).enumerate() {
            if actual.trim() != expected.trim() {
                return Err(format!(
                    "pass {}: output mismatch\n  expected: {}\n  actual:   {}",
                    i + 1,
                    expected.trim(),
                    actual.trim()
                ));
            }
        }
    }

    if let Some(expected) = config.expect_store_gets {
        if store_gets != expected {
            return Err(format!("expected {} store get(s), got {}", expected, store_gets));
        }
    }

    Ok(())
}

/// Discover `.test.ss` files grouped by category (subfolder relative to root).
/// Files directly in `root` get category "" (uncategorized).
fn discover_categorized(root: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut categories: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    collect_tests(root, root, &mut categories);
    for files in categories.values_mut() {
        files.sort();
    }
    categories
}

fn collect_tests(dir: &Path, root: &Path, out: &mut BTreeMap<String, Vec<PathBuf>>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tests(&path, root, out);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.ends_with(FIXTURE_SUFFIX) {
                let category = path
                    .parent()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                out.entry(category).or_default().push(path);
            }
        }
    }
}

/// List available categories for the given test path.
pub fn list_categories(path: &Path) {
    if path.is_file() {
        eprintln!("(single file, no categories)");
        return;
    }

    let categories = discover_categorized(path);
    if categories.is_empty() {
        eprintln!("no {} files found in {}", FIXTURE_SUFFIX, path.display());
        return;
    }

    eprintln!("available categories:");
    for (cat, files) in &categories {
        let label = if cat.is_empty() { "(root)" } else { cat.as_str() };
        eprintln!("  {} ({} tests)", label, files.len());
    }
}

fn paint(s: &str, code: &str, no_color: bool) -> String {
    if no_color {
        s.to_string()
    } else {
        format!("\x1b[{}m{}\x1b[0m", code, s)
    }
}

fn test_label<'a>(result: &'a TestResult) -> &'a str {
    result.description.as_deref().unwrap_or_else(|| {
        result
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_suffix(FIXTURE_SUFFIX))
            .unwrap_or("?")
    })
}

/// Run all `.test.ss` files under `path` (or a single file).
/// If `categories` is non-empty, only run tests in those categories.
/// Returns exit code: 0 = all pass, 1 = any failure.
pub fn run_tests(path: &Path, no_color: bool, categories: &[String]) -> i32 {
    let run_categories: BTreeMap<String, Vec<PathBuf>> = if path.is_file() {
        BTreeMap::from([(String::new(), vec![path.to_path_buf()])])
    } else {
        let all_categories = discover_categorized(path);
        if all_categories.is_empty() {
            eprintln!("no {} files found in {}", FIXTURE_SUFFIX, path.display());
            return 1;
        }
        if categories.is_empty() {
            all_categories
        } else {
            filter_categories(all_categories, categories)
        }
    };

    if run_categories.is_empty() {
        eprintln!("no matching categories found");
        return 1;
    }

    let mut passed = 0usize;
    let mut failures: Vec<TestResult> = Vec::new();

    for (cat, files) in &run_categories {
        if !path.is_file() {
            let header = if cat.is_empty() { "(root)" } else { cat.as_str() };
            eprintln!();
            eprintln!("{}", paint(header, "1", no_color));
        }

        for file in files {
            let result = run_single_test(file);
            match &result.outcome {
                TestOutcome::Pass => {
                    passed += 1;
                    eprintln!("  {}  {}", paint("PASS", "32", no_color), test_label(&result));
                }
                TestOutcome::Fail(_) => {
                    eprintln!("  {}  {}", paint("FAIL", "31", no_color), test_label(&result));
                    failures.push(result);
                }
            }
        }
    }

    if !failures.is_empty() {
        eprintln!();
        eprintln!("failures:");
        for f in &failures {
            eprintln!();
            eprintln!("  --- {} ---", f.path.display());
            if let TestOutcome::Fail(reason) = &f.outcome {
                for line in reason.lines() {
                    eprintln!("  {}", line);
                }
            }
        }
    }

    eprintln!();
    let failed = failures.len();
    if failed == 0 {
        eprintln!("test result: {}. {} passed, 0 failed", paint("ok", "32", no_color), passed);
        0
    } else {
        eprintln!(
            "test result: {}. {} passed, {} failed (of {})",
            paint("FAILED", "31", no_color),
            passed,
            failed,
            passed + failed
        );
        1
    }
}

fn filter_categories(
    all_categories: BTreeMap<String, Vec<PathBuf>>,
    requested: &[String],
) -> BTreeMap<String, Vec<PathBuf>> {
    let mut filtered = BTreeMap::new();
    for req in requested {
        let req = req.trim_matches('/');
        let mut found = false;
        for (cat, files) in &all_categories {
            if cat == req || cat.starts_with(&format!("{}/", req)) {
                filtered.insert(cat.clone(), files.clone());
                found = true;
            }
        }
        if !found {
            eprintln!(
                "warning: category '{}' not found (available: {})",
                req,
                all_categories
                    .keys()
                    .map(|k| if k.is_empty() { "(root)" } else { k.as_str() })
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fixture: &str) -> Result<(), String> {
        let (config, source) = parse_test_file(fixture)?;
        check(&config, source)
    }

    #[test]
    fn frontmatter_splits_config_and_source() {
        let (config, source) = parse_test_file("---\ndescription = \"d\"\n[data]\nA = 1\n---\n$A\n").unwrap();
        assert_eq!(config.description.as_deref(), Some("d"));
        assert_eq!(config.data.get("A"), Some(&toml::Value::Integer(1)));
        assert_eq!(source, "$A\n");
    }

    #[test]
    fn passes_share_one_store() {
        let fixture = "---\n\
            expect_outputs = [\"1\", \"1\", \"3\"]\n\
            expect_store_gets = 3\n\
            [data]\nK = 1\n\
            [[passes]]\nV = 1\n\
            [[passes]]\nV = 2\n\
            [[passes]]\nK = 2\nV = 3\n\
            ---\n<% cached $K %>$V<% end_cached %>";
        assert_eq!(run(fixture), Ok(()));
    }

    #[test]
    fn mismatch_is_reported() {
        let fixture = "---\nexpect_output = \"no\"\n---\nyes";
        assert!(run(fixture).unwrap_err().contains("output mismatch"));
    }

    #[test]
    fn compile_error_expectation() {
        let fixture = "---\nexpect_compile_error = true\n---\n<% if $A %><% cached %>x<% end_cached %><% end_if %>";
        assert_eq!(run(fixture), Ok(()));
    }

    #[test]
    fn render_error_expectation() {
        let fixture = "---\nexpect_error = \"undefined field: $Nope\"\n---\n<% cached $Nope %>x<% end_cached %>";
        assert_eq!(run(fixture), Ok(()));
    }

    #[test]
    fn bundled_fixtures_pass() {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        assert_eq!(run_tests(&fixtures, true, &[]), 0);
    }

    #[test]
    fn unknown_frontmatter_key_is_rejected() {
        assert!(parse_test_file("---\nexpect_outptu = \"x\"\n---\n").is_err());
    }
}
