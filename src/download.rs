use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::http_client::{REFERER_URL, USER_AGENT, http_client};
use crate::manifest::{ItemStatus, Manifest, ManifestItem};

pub const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP_MS: u64 = 1_500;
const CURL_ERR_TAIL: usize = 800;

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub status: ItemStatus,
    pub url: String,
    pub bytes: Option<u64>,
    pub error: Option<String>,
    pub curl_err_tail: Option<String>,
}

impl DownloadResult {
    fn new(status: ItemStatus, url: &str) -> Self {
        Self {
            status,
            url: url.to_string(),
            bytes: None,
            error: None,
            curl_err_tail: None,
        }
    }
}

fn non_empty_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len()).filter(|len| *len > 0)
}

fn part_path(out_path: &Path) -> PathBuf {
    let mut name = out_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn fetch_once(url: &str, tmp_path: &Path) -> Result<u64, (String, bool)> {
    let client = http_client().map_err(|e| (e.to_string(), true))?;
    let mut res = client.get(url).send().map_err(|e| (e.to_string(), false))?;
    let status = res.status();
    if status != StatusCode::OK {
        let fatal = matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS);
        return Err((format!("HTTP {}", status.as_u16()), fatal));
    }
    let mut file = File::create(tmp_path).map_err(|e| (e.to_string(), true))?;
    res.copy_to(&mut file).map_err(|e| (e.to_string(), false))
}

/// Fetches `url` into `out_path` through a `.part` file. Retries sequentially with
/// linear backoff; 403 and 429 end the retries early. Falls back to `curl`.
pub fn download_stream(url: &str, out_path: &Path, force: bool, max_attempts: u32) -> Result<DownloadResult> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if !force && let Some(bytes) = non_empty_len(out_path) {
        let mut res = DownloadResult::new(ItemStatus::SkippedExists, url);
        res.bytes = Some(bytes);
        return Ok(res);
    }

    let tmp_path = part_path(out_path);
    let mut last_err = String::new();
    for attempt in 1..=max_attempts {
        match fetch_once(url, &tmp_path) {
            Ok(_) if non_empty_len(&tmp_path).is_some() => {
                fs::rename(&tmp_path, out_path)
                    .with_context(|| format!("swap {}", out_path.display()))?;
                let mut res = DownloadResult::new(ItemStatus::Downloaded, url);
                res.bytes = non_empty_len(out_path);
                return Ok(res);
            }
            Ok(_) => last_err = "empty_file_after_download".to_string(),
            Err((err, fatal)) => {
                last_err = err;
                if fatal {
                    break;
                }
            }
        }
        warn!(url, attempt, error = %last_err, "download attempt failed");
        thread::sleep(Duration::from_millis(BACKOFF_STEP_MS * u64::from(attempt)));
    }
    let _ = fs::remove_file(&tmp_path);

    match curl_download(url, out_path) {
        Ok(()) if non_empty_len(out_path).is_some() => {
            let mut res = DownloadResult::new(ItemStatus::DownloadedFallback, url);
            res.bytes = non_empty_len(out_path);
            res.error = Some(last_err);
            Ok(res)
        }
        Ok(()) => {
            let mut res = DownloadResult::new(ItemStatus::Failed, url);
            res.error = Some(last_err);
            res.curl_err_tail = Some("curl produced an empty file".to_string());
            Ok(res)
        }
        Err(err) => {
            let mut res = DownloadResult::new(ItemStatus::Failed, url);
            res.error = Some(last_err);
            res.curl_err_tail = Some(err.to_string());
            Ok(res)
        }
    }
}

fn curl_download(url: &str, out_path: &Path) -> Result<()> {
    let output = Command::new("curl")
        .args(["-L", "--fail", "-A", USER_AGENT, "-H"])
        .arg(format!("Referer: {REFERER_URL}"))
        .args(["--retry", "3", "--retry-delay", "2", "--connect-timeout", "20", "-o"])
        .arg(out_path)
        .arg(url)
        .output()
        .context("spawn curl")?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .chars()
        .rev()
        .take(CURL_ERR_TAIL)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Err(anyhow!("curl exited with {}: {}", output.status, tail.trim()))
}

pub fn download_all(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    for ds in &cfg.datasets {
        let out_path = cfg.paths.raw.join(ds.raw_file_name());
        let force = cfg.refresh.download.for_source(ds.is_rolling());

        let mut result = None;
        for url in &ds.urls {
            info!(dataset = %ds.key, url = %url, force, "download");
            let res = download_stream(url, &out_path, force, MAX_ATTEMPTS)?;
            let failed = res.status == ItemStatus::Failed;
            result = Some(res);
            if !failed {
                break;
            }
        }
        let Some(res) = result else {
            manifest.push(
                ManifestItem::new(&ds.key, ItemStatus::Failed).with("error", "no urls configured"),
            );
            continue;
        };
        if res.status == ItemStatus::Failed {
            warn!(dataset = %ds.key, error = ?res.error, "download failed");
        }
        let mut item = ManifestItem::new(&ds.key, res.status)
            .with("out_path", out_path.display().to_string())
            .with("kind", ds.kind)
            .with("level", ds.level)
            .with("url", &res.url);
        if let Some(bytes) = res.bytes {
            item = item.with("bytes", bytes);
        }
        if let Some(err) = &res.error {
            item = item.with("error", err);
        }
        if let Some(tail) = &res.curl_err_tail {
            item = item.with("curl_err_tail", tail);
        }
        manifest.push(item);
    }
    let path = manifest.write(&cfg.paths.logs, "download")?;
    info!(
        manifest = %path.display(),
        failed = manifest.count(ItemStatus::Failed),
        "download complete"
    );
    Ok(path)
}
