use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

fn bin_path() -> PathBuf {
    let exe = std::env::current_exe().expect("failed to locate test binary");
    let target_dir = exe
        .parent()
        .and_then(|p| p.parent())
        .expect("unexpected test binary path");
    let candidate = target_dir.join("splitmig.exe");
    if candidate.exists() {
        candidate
    } else {
        target_dir.join("splitmig")
    }
}

fn make_temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("splitmig_cli_bin_{}_{}", tag, nanos));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn db_url(root: &Path) -> String {
    let db_path = root.join("test.db");
    format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    )
}

fn splitmig(root: &Path, args: &[&str]) -> std::process::Output {
    Command::new(bin_path())
        .current_dir(root)
        .env_remove("DATABASE_URL")
        .env_remove("SPLITMIG_ROOT")
        .env("DB_RETRY_DELAY_MS", "1")
        .arg("--no-color")
        .args(args)
        .output()
        .expect("failed to run splitmig")
}

#[test]
fn cli_main_creates_a_migration_template() {
    let root = make_temp_dir("create");
    let output = splitmig(&root, &["migrations", "create", "create_items"]);
    assert!(output.status.success());

    let created: Vec<_> = fs::read_dir(root.join("migrations"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(created.len(), 1);
    assert!(created[0].ends_with("_create_items.toml"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn cli_main_applies_and_reports_status() {
    let root = make_temp_dir("apply");
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(
        migrations.join("1700000000_create_items.toml"),
        "[[raw]]\nup = \"CREATE TABLE items (id INTEGER)\"\ndown = \"DROP TABLE items\"\n",
    )
    .unwrap();
    let url = db_url(&root);

    let output = splitmig(&root, &["migrations", "apply", "--database", &url]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[OK] Applied 1700000000_create_items"), "{stdout}");

    let output = splitmig(&root, &["migrations", "status", "--database", &url]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[applied] migrations/1700000000_create_items.toml"), "{stdout}");

    let output = splitmig(&root, &["migrations", "rollback", "--yes", "--database", &url]);
    assert!(output.status.success());

    let output = splitmig(&root, &["migrations", "status", "--database", &url]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[pending]"), "{stdout}");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn cli_main_fails_on_unparseable_file() {
    let root = make_temp_dir("broken");
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(migrations.join("1700000000_broken.toml"), "[[table]\n").unwrap();

    let output = splitmig(&root, &["migrations", "apply", "--database", &db_url(&root)]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[ERROR]"), "{stdout}");

    let _ = fs::remove_dir_all(&root);
}
