//! Integration tests for imgforge

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use image::{ImageFormat, RgbImage};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Command isolated to a temp dir: config file, storage root and audit log
    fn imgforge(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("imgforge");
        cmd.env("IMGFORGE_CONFIG", temp.path().join("config.toml"))
            .env("STORAGE_TYPE", "local")
            .env("STORAGE_PATH", temp.path().join("data"))
            .env("XDG_STATE_HOME", temp.path().join("state"))
            .env_remove("LOG_LEVEL")
            .env_remove("URL_INGEST_ALLOWED_DOMAINS");
        cmd
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        });
        let path = dir.join(name);
        img.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    fn storage_key(stdout: &[u8]) -> String {
        let reports: serde_json::Value = serde_json::from_slice(stdout).unwrap();
        reports[0]["output"]["storage_key"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("image transform engine"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("imgforge"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_includes_env_overlay() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .env("MAX_CONCURRENT_JOBS", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[limits]"))
            .stdout(predicate::str::contains("max_concurrent_jobs = 7"));
    }

    #[test]
    fn config_init_then_set() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["config", "init"])
            .assert()
            .success();
        imgforge(&temp)
            .args(["config", "set", "cache.ttl_seconds", "60"])
            .assert()
            .success();

        let content = std::fs::read_to_string(temp.path().join("config.toml")).unwrap();
        assert!(content.contains("ttl_seconds = 60"));
    }

    #[test]
    fn invalid_env_is_reported() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .env("MAX_CONCURRENT_JOBS", "0")
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("MAX_CONCURRENT_JOBS"));
    }

    #[test]
    fn process_resizes_into_output_file() {
        let temp = TempDir::new().unwrap();
        let input = write_png(temp.path(), "in.png", 40, 20);
        let out = temp.path().join("out.png");

        imgforge(&temp)
            .arg("process")
            .arg(&input)
            .args(["--resize", "10x10", "--json", "-o"])
            .arg(&out)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"storage_key\""));

        let resized = image::open(&out).unwrap();
        assert_eq!((resized.width(), resized.height()), (10, 5));
    }

    #[test]
    fn process_then_fetch_by_key() {
        let temp = TempDir::new().unwrap();
        let input = write_png(temp.path(), "in.png", 16, 16);

        let assert = imgforge(&temp)
            .arg("process")
            .arg(&input)
            .args(["--grayscale", "--format", "webp", "--json"])
            .assert()
            .success();
        let key = storage_key(&assert.get_output().stdout);
        assert!(key.starts_with("outputs/"));
        assert!(key.ends_with(".webp"));

        let fetched = temp.path().join("fetched.webp");
        imgforge(&temp)
            .args(["fetch", &key, "-o"])
            .arg(&fetched)
            .assert()
            .success();

        let stored = std::fs::read(temp.path().join("data").join(&key)).unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), stored);
    }

    #[test]
    fn identical_inputs_share_a_key() {
        let temp = TempDir::new().unwrap();
        let a = write_png(temp.path(), "a.png", 12, 12);
        let b = temp.path().join("b.png");
        std::fs::copy(&a, &b).unwrap();

        let assert = imgforge(&temp)
            .arg("process")
            .arg(&a)
            .arg(&b)
            .args(["--thumbnail", "6", "--json"])
            .assert()
            .success();
        let reports: serde_json::Value =
            serde_json::from_slice(&assert.get_output().stdout).unwrap();
        assert_eq!(
            reports[0]["output"]["storage_key"],
            reports[1]["output"]["storage_key"]
        );
    }

    #[test]
    fn process_rejects_non_image() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("notes.png");
        std::fs::write(&input, b"definitely not an image").unwrap();

        imgforge(&temp)
            .arg("process")
            .arg(&input)
            .assert()
            .failure()
            .stderr(predicate::str::contains("1 of 1 job(s) failed"));
    }

    #[test]
    fn process_missing_file() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["process", "does-not-exist.png"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does-not-exist.png"));
    }

    #[test]
    fn process_blocks_loopback_url() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["process", "--url", "http://127.0.0.1:9/a.png", "--json"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Blocked request"));
    }

    #[test]
    fn process_url_disabled() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .env("URL_INGEST_ENABLED", "false")
            .args(["process", "--url", "https://example.com/a.png", "--json"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("disabled"));
    }

    #[test]
    fn fetch_rejects_traversal_key() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["fetch", "../etc/passwd"])
            .assert()
            .failure();
    }

    #[test]
    fn fetch_missing_key() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["fetch", "outputs/ab/missing.png"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found").or(predicate::str::contains("Not found")));
    }

    #[test]
    fn status_reports_ready() {
        let temp = TempDir::new().unwrap();
        imgforge(&temp)
            .args(["status", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"ready\": true"));
    }
}
