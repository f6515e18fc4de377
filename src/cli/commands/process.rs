//! Process command - run transform jobs through the engine

use crate::audit::AuditLog;
use crate::cli::args::ProcessArgs;
use crate::config::Config;
use crate::engine::{JobEngine, JobHandle, JobOutput, JobRequest};
use crate::error::{ForgeError, ForgeResult};
use crate::transform::TransformParams;
use crate::ui::{self, JobProgress, UiContext};
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// One line of `--json` output
#[derive(Debug, Serialize)]
struct JobReport {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    written_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute the process command
pub async fn execute(args: ProcessArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect().with_quiet(args.json);
    let params = args.params();

    let audit = Arc::new(AuditLog::new(config));
    let engine = JobEngine::from_config(config, audit).await?;

    let total = args.job_count();
    let progress = JobProgress::new(&ctx, total as u64);

    let outcome = tokio::select! {
        reports = run_jobs(&engine, &args, &params, &progress) => reports,
        _ = tokio::signal::ctrl_c() => Err(ForgeError::Cancelled),
    };
    progress.finish();
    engine.shutdown().await;

    let mut reports = outcome?;
    if let Some(output) = &args.output {
        write_outputs(&engine, &mut reports, output, total).await?;
    }

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_summary(&ctx, &reports);
    }

    if failed > 0 {
        return Err(ForgeError::User(format!(
            "{} of {} job(s) failed",
            failed, total
        )));
    }
    Ok(())
}

/// Submit every input up front, then collect results as they finish
async fn run_jobs(
    engine: &JobEngine,
    args: &ProcessArgs,
    params: &TransformParams,
    progress: &JobProgress,
) -> ForgeResult<Vec<JobReport>> {
    let mut submitted: Vec<(String, JobHandle)> = Vec::with_capacity(args.job_count());
    for path in &args.inputs {
        let bytes = fs::read(path)
            .await
            .map_err(|e| ForgeError::io(format!("reading {}", path.display()), e))?;
        let request = JobRequest::upload(Bytes::from(bytes), mime_for_path(path), params.clone());
        debug!("Submitting {} as request {}", path.display(), request.id);
        submitted.push((path.display().to_string(), engine.submit(request)));
    }
    for url in &args.url {
        let request = JobRequest::url(url.clone(), params.clone());
        debug!("Submitting {} as request {}", url, request.id);
        submitted.push((url.clone(), engine.submit(request)));
    }

    let mut pending: FuturesUnordered<_> = submitted
        .into_iter()
        .enumerate()
        .map(|(index, (source, handle))| async move { (index, source, handle.wait().await) })
        .collect();

    let mut finished = Vec::with_capacity(pending.len());
    while let Some((index, source, result)) = pending.next().await {
        progress.job_done(&source, result.is_ok());
        finished.push((index, source, result));
    }
    finished.sort_by_key(|(index, _, _)| *index);

    Ok(finished
        .into_iter()
        .map(|(_, source, result)| match result {
            Ok(output) => JobReport {
                source,
                output: Some(output),
                written_to: None,
                error: None,
            },
            Err(e) => JobReport {
                source,
                output: None,
                written_to: None,
                error: Some(e.to_string()),
            },
        })
        .collect())
}

/// Copy stored outputs to `--output`
///
/// A single job writes to the path itself unless it is an existing
/// directory; several jobs always write into it as a directory.
async fn write_outputs(
    engine: &JobEngine,
    reports: &mut [JobReport],
    output: &Path,
    total: usize,
) -> ForgeResult<()> {
    let into_dir = total > 1 || output.is_dir();
    if into_dir {
        fs::create_dir_all(output)
            .await
            .map_err(|e| ForgeError::io(format!("creating {}", output.display()), e))?;
    }

    for (index, report) in reports.iter_mut().enumerate() {
        let Some(job) = &report.output else {
            continue;
        };
        let dest = if into_dir {
            output.join(output_file_name(&report.source, index, job))
        } else {
            output.to_path_buf()
        };
        let bytes = engine.fetch_output(&job.storage_key).await?;
        fs::write(&dest, &bytes)
            .await
            .map_err(|e| ForgeError::io(format!("writing {}", dest.display()), e))?;
        report.written_to = Some(dest);
    }
    Ok(())
}

/// `<source stem>.<ext>`, falling back to the fingerprint for URLs without a
/// usable file name
fn output_file_name(source: &str, index: usize, job: &JobOutput) -> String {
    let ext = job.format.extension();
    let stem = source
        .rsplit(['/', '\\'])
        .next()
        .and_then(|name| name.split(['?', '#']).next())
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty());
    match stem {
        Some(stem) => format!("{}-{}.{}", stem, index, ext),
        None => format!("{}.{}", job.fingerprint.short(), ext),
    }
}

/// Declared content type from a file extension
fn mime_for_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => return None,
    };
    Some(mime.to_string())
}

fn print_summary(ctx: &UiContext, reports: &[JobReport]) {
    for report in reports {
        match (&report.output, &report.error) {
            (Some(job), _) => {
                let origin = if job.cache_hit { "cached" } else { "processed" };
                ui::step_ok_detail(
                    ctx,
                    &report.source,
                    &format!(
                        "{}x{} {}, {}, {}",
                        job.width,
                        job.height,
                        job.format,
                        job.size_display(),
                        origin
                    ),
                );
                ui::key_value(ctx, "key", &job.storage_key);
                if let Some(path) = &report.written_to {
                    ui::key_value(ctx, "written", &path.display().to_string());
                }
            }
            (None, Some(error)) => ui::step_error_detail(ctx, &report.source, error),
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::transform::{Operation, OutputFormat};

    fn output(format: OutputFormat) -> JobOutput {
        let raw = crate::fixtures::raw_png(2, 2);
        let params = TransformParams::new(Operation::Convert)
            .normalize(&raw.info, false)
            .unwrap();
        let fp = Fingerprint::compute(&raw.content_hash, "raster", 1, &params);
        JobOutput {
            fingerprint: fp,
            storage_key: fp.storage_key(format.extension()),
            size_bytes: 10,
            format,
            content_type: format.mime(),
            width: 1,
            height: 1,
            cache_hit: false,
            cached: true,
        }
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for_path(Path::new("a.JPG")).as_deref(), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.webp")).as_deref(), Some("image/webp"));
        assert_eq!(mime_for_path(Path::new("a.tiff")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[test]
    fn output_name_from_file_path() {
        let job = output(OutputFormat::Webp);
        assert_eq!(output_file_name("photos/cat.png", 0, &job), "cat-0.webp");
    }

    #[test]
    fn output_name_from_url() {
        let job = output(OutputFormat::Jpeg);
        assert_eq!(
            output_file_name("https://example.com/img/dog.png?size=2", 3, &job),
            "dog-3.jpg"
        );
    }

    #[test]
    fn output_name_falls_back_to_fingerprint() {
        let job = output(OutputFormat::Png);
        let name = output_file_name("https://example.com/", 0, &job);
        assert_eq!(name, format!("{}.png", job.fingerprint.short()));
    }
}
