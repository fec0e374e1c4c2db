//! Integration tests for packages, glob resolution and cleanup.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use oxpipe_store::{
    ActivePackages, CleanupService, CleanupSettings, CleanupStatus, NoActivePackages, PackageStore,
    PropertyStore, find_files,
};
use tempfile::TempDir;

fn backdate(path: &Path) {
    let old = SystemTime::now() - Duration::from_secs(2 * 3600);
    fs::File::open(path).unwrap().set_modified(old).unwrap();
}

fn relative_names(files: &[std::path::PathBuf], base: &Path) -> Vec<String> {
    let base = std::path::absolute(base).unwrap();
    let mut names: Vec<String> = files
        .iter()
        .map(|f| f.strip_prefix(&base).unwrap().to_string_lossy().replace('\\', "/"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_package_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = PackageStore::new(tmp.path().join("packages")).unwrap();
    let source = tmp.path().join("report.psml");
    fs::write(&source, "<document/>").unwrap();

    let mut package = store.new_package("demo", Some(&source)).unwrap();
    assert!(package.id().starts_with("DEMO-"));
    assert_eq!(package.id(), package.id().to_uppercase());
    package.set_property("owner", "ops");
    package.set_parameter("lang", "en");
    package.persist().unwrap();

    let reopened = store.get_package(package.id()).unwrap();
    assert_eq!(reopened.original_name(), Some("report.psml"));
    assert_eq!(reopened.original(), package.original());
    assert_eq!(reopened.property("owner"), Some("ops"));
    assert_eq!(reopened.parameter("lang"), Some("en"));
    assert_eq!(reopened.properties(), package.properties());
    assert_eq!(store.list_packages().unwrap(), vec![package.id().to_string()]);
    assert!(!reopened.directory_path().contains('\\'));
}

#[test]
fn test_unsaved_changes_are_not_persisted() {
    let tmp = TempDir::new().unwrap();
    let store = PackageStore::new(tmp.path()).unwrap();
    let mut package = store.new_package("demo", None).unwrap();
    package.set_property("draft", "yes");

    let reopened = store.get_package(package.id()).unwrap();
    assert_eq!(reopened.property("draft"), None);
    assert!(store.get_package("UNKNOWN-1-1").is_none());
}

#[test]
fn test_property_file_format() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("info.properties");
    let mut props = PropertyStore::new();
    props.set("path", "C:\\data\\in.xml");
    props.set("multi", "line one\nline two");
    props.save(&path, Some("package")).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("#package"));
    let loaded = PropertyStore::load(&path).unwrap();
    assert_eq!(loaded.get("path"), Some("C:\\data\\in.xml"));
    assert_eq!(loaded.get("multi"), Some("line one\nline two"));
}

#[test]
fn test_glob_depth_semantics() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path();
    fs::create_dir_all(base.join("src/util")).unwrap();
    fs::write(base.join("Main.java"), "").unwrap();
    fs::write(base.join("src/App.java"), "").unwrap();
    fs::write(base.join("src/util/Io.java"), "").unwrap();
    fs::write(base.join("README.md"), "").unwrap();

    let direct = find_files("*.java", base).unwrap();
    assert_eq!(relative_names(&direct, base), vec!["Main.java"]);

    let nested = find_files("**/*.java", base).unwrap();
    assert_eq!(
        relative_names(&nested, base),
        vec!["src/App.java", "src/util/Io.java"]
    );

    let all = find_files("**.java", base).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|f| f.is_absolute()));

    let alternatives = find_files("{Main,README}.*", base).unwrap();
    assert_eq!(relative_names(&alternatives, base), vec!["Main.java", "README.md"]);

    let negated = find_files("[!M]*", base).unwrap();
    assert_eq!(relative_names(&negated, base), vec!["README.md"]);
}

#[test]
fn test_package_file_lookup() {
    let tmp = TempDir::new().unwrap();
    let store = PackageStore::new(tmp.path()).unwrap();
    let package = store.new_package("demo", None).unwrap();
    fs::create_dir_all(package.directory().join("out")).unwrap();
    fs::write(package.directory().join("out/a.xml"), "").unwrap();
    fs::write(package.directory().join("out/b.xml"), "").unwrap();

    assert_eq!(package.get_files("out/*.xml").len(), 2);
    assert_eq!(package.get_files("out/a.xml, out/b.xml").len(), 2);
    assert_eq!(
        package.get_file("out/missing.xml"),
        Some(package.directory().join("out/missing.xml"))
    );
    assert_eq!(package.get_file("*.json"), None);
    assert!(package.get_files("out").iter().all(|p| p.is_dir()));
}

struct OnlyActive(String);

impl ActivePackages for OnlyActive {
    fn is_active(&self, package_id: &str) -> bool {
        package_id == self.0
    }
}

#[test]
fn test_cleanup_respects_active_packages() {
    let tmp = TempDir::new().unwrap();
    let store = PackageStore::new(tmp.path()).unwrap();
    let busy = store.new_package("demo", None).unwrap();
    let stale = store.new_package("demo", None).unwrap();

    for package in [&busy, &stale] {
        let nested = package.directory().join("work");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("tmp.xml"), "x").unwrap();
        backdate(&nested.join("tmp.xml"));
        backdate(&package.directory().join("info.properties"));
        backdate(&nested);
        backdate(package.directory());
    }
    let upload = tmp.path().join("upload");
    fs::create_dir_all(&upload).unwrap();
    fs::write(upload.join("old.bin"), "x").unwrap();
    backdate(&upload.join("old.bin"));
    backdate(&upload);

    let settings = CleanupSettings::new(tmp.path()).with_max_inactive(Duration::from_secs(60));
    let service = CleanupService::new(settings, Arc::new(OnlyActive(busy.id().to_string()))).unwrap();
    let report = service.run_once();

    assert!(busy.directory().join("work/tmp.xml").exists());
    assert!(!stale.directory().exists());
    assert!(upload.is_dir());
    assert!(!upload.join("old.bin").exists());
    assert_eq!(report.skipped_active, vec![busy.id().to_string()]);
    assert_eq!(report.files_deleted, 3);
    assert_eq!(report.directories_deleted, 2);
    assert_eq!(service.status(), CleanupStatus::NotStarted);
}

#[tokio::test]
async fn test_cleanup_loop_start_stop() {
    let tmp = TempDir::new().unwrap();
    let settings = CleanupSettings::new(tmp.path())
        .with_initial_delay(Duration::from_secs(3600))
        .with_delay(Duration::from_secs(3600));
    let service = CleanupService::new(settings, Arc::new(NoActivePackages)).unwrap();

    assert!(service.start());
    assert!(!service.start());
    assert!(service.is_running());
    assert_eq!(service.status(), CleanupStatus::WaitingNextIteration);

    service.stop().await;
    assert!(!service.is_running());
    assert_eq!(service.status(), CleanupStatus::Stopped);
}
