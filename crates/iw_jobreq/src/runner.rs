//! Per-book execution of a `job_requests.json` document (§4.I), modeled on
//! `casparian::runner`'s execute-per-unit shape and
//! `casparian_worker::cancel`'s cooperative cancellation boundaries. The
//! runner never writes to the processed registry itself -- only a
//! diagnostics subscriber reacting to the job's terminal `diag.job.end`
//! does that, so registry admission always happens strictly after
//! SUCCEEDED (§3 invariant 4).

use crate::builder::{AudioProcessingOptions, DeleteSourceOptions, JobRequestDoc};
use iw_canon::error::CoreError;
use iw_discovery::{book_ref, BookFingerprint, EnrichmentCache, UnitType};
use iw_fs::{Jail, RelativePath, Root};
use iw_ids::JobId;
use iw_jobs::{identity_key, JobService, ProcessedRegistry};
use std::process::Command;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "flac", "wav", "ogg", "opus"];

pub struct RunnerConfig {
    /// External codec binary invoked for `.mp3` re-encodes. Defaults to
    /// `ffmpeg`, overridable so tests can point at a stub.
    pub codec_binary: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            codec_binary: "ffmpeg".to_string(),
        }
    }
}

fn rel(path: &str) -> RelativePath {
    RelativePath::parse(path).expect("runner-constructed path is always a safe literal")
}

fn source_root(name: &str) -> Option<Root> {
    Root::parse(name)
}

/// Execute every `import.batch` action in `doc` against the jail, updating
/// `job_id`'s progress and log as it goes. Returns `Ok(())` once every book
/// has been handled (including ones skipped as already-processed);
/// terminal job-state transitions (`mark_succeeded` / `mark_failed`) are
/// applied by the caller, which also owns marking the processed registry
/// after the transition commits.
pub fn run_import_job(
    jail: &Jail,
    job_service: &JobService,
    registry: &ProcessedRegistry,
    job_id: &JobId,
    doc: &JobRequestDoc,
    config: &RunnerConfig,
    token: &iw_jobs::CancellationToken,
) -> Result<(), CoreError> {
    let total = doc.actions.len().max(1);
    let mut cache = EnrichmentCache::load(jail.clone())?;

    for (index, action) in doc.actions.iter().enumerate() {
        if token.is_cancelled() {
            job_service.append_log(job_id, "cancelled before copy-begin boundary")?;
            return Ok(());
        }

        let source_root_name = action.source.root.as_str();
        let source_root_enum = source_root(source_root_name)
            .ok_or_else(|| CoreError::internal(format!("unknown action source root: {}", source_root_name)))?;
        let source_rel = rel(&action.source.relative_path);
        let unit_type = resolve_unit_type(jail, source_root_enum, &source_rel)?;

        let fingerprint = cache
            .enrich(jail, source_root_enum, source_root_name, &source_rel, unit_type)
            .ok()
            .and_then(|e| e.fingerprint)
            .unwrap_or_else(|| BookFingerprint::basic(book_ref(source_root_name, source_rel.as_str())));
        let key = identity_key(&fingerprint.algo, &fingerprint.value);

        if registry.is_processed(&key) {
            job_service.append_log(job_id, &format!("already processed: {}", key))?;
            job_service.update_progress(job_id, (index + 1) as f64 / total as f64)?;
            continue;
        }

        execute_book_action(jail, job_service, job_id, action, doc, unit_type, &key, config, token)?;
        job_service.update_progress(job_id, (index + 1) as f64 / total as f64)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn execute_book_action(
    jail: &Jail,
    job_service: &JobService,
    job_id: &JobId,
    action: &crate::builder::BookAction,
    doc: &JobRequestDoc,
    unit_type: UnitType,
    identity: &str,
    config: &RunnerConfig,
    token: &iw_jobs::CancellationToken,
) -> Result<(), CoreError> {
    let source_root_enum = source_root(&action.source.root)
        .ok_or_else(|| CoreError::internal(format!("unknown action source root: {}", action.source.root)))?;
    let source_rel = rel(&action.source.relative_path);

    if token.is_cancelled() {
        job_service.append_log(job_id, "cancelled at copy-begin boundary")?;
        return Ok(());
    }

    let (target_root_enum, target_rel) = place_target(jail, action, &source_rel, unit_type, job_id)?;

    job_service.append_log(
        job_id,
        &format!(
            "copied {}:{} -> {}:{}",
            action.source.root,
            source_rel.as_str(),
            target_root_enum.as_str(),
            target_rel.as_str()
        ),
    )?;

    if doc.options.audio_processing.enabled && doc.options.audio_processing.confirmed {
        if token.is_cancelled() {
            job_service.append_log(job_id, "cancelled at audio-begin boundary")?;
            return Ok(());
        }
        reencode_audio(jail, job_service, job_id, target_root_enum, &target_rel, &doc.options.audio_processing, config)?;
    }

    if doc.options.delete_source.enabled && doc.mode == "stage" {
        if token.is_cancelled() {
            job_service.append_log(job_id, "cancelled at delete-source-begin boundary")?;
            return Ok(());
        }
        guard_and_delete_source(jail, job_service, job_id, source_root_enum, &source_rel, unit_type, identity, &doc.options.delete_source)?;
    }

    job_service.append_log(job_id, &format!("processed_key: {}", identity))?;

    Ok(())
}

fn resolve_unit_type(jail: &Jail, root: Root, rel: &RelativePath) -> Result<UnitType, CoreError> {
    let stat = jail.stat(root, rel).map_err(|e| e.into_core_error(true))?;
    Ok(if stat.is_dir { UnitType::Dir } else { UnitType::File })
}

/// mode=stage,unit=dir -> `stage:import/stage/<job_id>/<book_rel>`;
/// mode=stage,unit=file -> `stage:import/stage/<job_id>/<stem>/<filename>`;
/// mode=inplace -> target_root/target_rel point at the source directly.
fn place_target(
    jail: &Jail,
    action: &crate::builder::BookAction,
    source_rel: &RelativePath,
    unit_type: UnitType,
    job_id: &JobId,
) -> Result<(Root, RelativePath), CoreError> {
    let target_root_enum = Root::parse(&action.target.root)
        .ok_or_else(|| CoreError::internal(format!("unknown action target root: {}", action.target.root)))?;

    let job_doc_root_is_stage = action.target.root == "stage";
    if !job_doc_root_is_stage {
        // inplace publish: target IS the source location under the action's
        // own source root, nothing to copy.
        let source_root_enum = Root::parse(&action.source.root)
            .ok_or_else(|| CoreError::internal(format!("unknown action source root: {}", action.source.root)))?;
        return Ok((source_root_enum, source_rel.clone()));
    }

    let job_id_component = job_id.as_str().to_string();
    let target_rel = match unit_type {
        UnitType::Dir => rel(&format!("import/stage/{}/{}", job_id_component, source_rel.as_str())),
        UnitType::File => {
            let path = std::path::Path::new(source_rel.as_str());
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("book");
            let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
            rel(&format!("import/stage/{}/{}/{}", job_id_component, stem, filename))
        }
    };

    let source_root_enum = Root::parse(&action.source.root)
        .ok_or_else(|| CoreError::internal(format!("unknown action source root: {}", action.source.root)))?;
    jail.copy(source_root_enum, source_rel, target_root_enum, &target_rel, true, true)
        .map_err(|e| e.into_core_error(false))?;
    Ok((target_root_enum, target_rel))
}

fn reencode_audio(
    jail: &Jail,
    job_service: &JobService,
    job_id: &JobId,
    target_root: Root,
    target_rel: &RelativePath,
    options: &AudioProcessingOptions,
    config: &RunnerConfig,
) -> Result<(), CoreError> {
    let entries = jail.list(target_root, target_rel, true).map_err(|e| e.into_core_error(true))?;
    for entry in entries.iter().filter(|e| !e.is_dir) {
        let lower = entry.rel_path.to_ascii_lowercase();
        let Some(ext) = AUDIO_EXTENSIONS.iter().find(|ext| lower.ends_with(&format!(".{}", ext))) else {
            continue;
        };
        if *ext != "mp3" {
            job_service.add_warning(job_id, format!("audio_processing_skipped_non_mp3: {}", entry.rel_path))?;
            continue;
        }

        let entry_rel = rel(&entry.rel_path);
        let abs = jail.resolve(target_root, &entry_rel).map_err(|e| e.into_core_error(false))?;
        let suffix = iw_canon::fingerprint_str(&entry.rel_path);
        let tmp_path = abs.with_extension(format!("{}.tmp", &suffix[..12]));

        let status = Command::new(&config.codec_binary)
            .arg("-y")
            .arg("-i")
            .arg(&abs)
            .arg("-b:a")
            .arg(bitrate_for(&options.bitrate_mode))
            .arg(&tmp_path)
            .status();

        match status {
            Ok(status) if status.success() => {
                std::fs::rename(&tmp_path, &abs).map_err(|e| CoreError::internal(e.to_string()))?;
            }
            Ok(status) => {
                let _ = std::fs::remove_file(&tmp_path);
                tracing::warn!(path = %entry.rel_path, %status, "audio re-encode subprocess failed");
                return Err(CoreError::internal(format!(
                    "audio re-encode subprocess exited with status {}",
                    status
                )));
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                tracing::warn!(path = %entry.rel_path, error = %e, "failed to spawn codec subprocess");
                return Err(CoreError::internal(format!("failed to spawn codec subprocess: {}", e)));
            }
        }
    }
    Ok(())
}

fn bitrate_for(mode: &str) -> &'static str {
    match mode {
        "cbr" => "128k",
        _ => "96k",
    }
}

fn guard_and_delete_source(
    jail: &Jail,
    job_service: &JobService,
    job_id: &JobId,
    source_root: Root,
    source_rel: &RelativePath,
    unit_type: UnitType,
    original_identity: &str,
    options: &DeleteSourceOptions,
) -> Result<(), CoreError> {
    if !options.guard_enabled {
        return delete_source_unit(jail, source_root, source_rel, unit_type);
    }

    let mut cache = EnrichmentCache::load(jail.clone())?;
    let source_root_name = source_root.as_str();
    let recomputed = cache
        .enrich(jail, source_root, source_root_name, source_rel, unit_type)
        .ok()
        .and_then(|e| e.fingerprint);

    let matches = recomputed
        .map(|fp| identity_key(&fp.algo, &fp.value) == original_identity)
        .unwrap_or(false);

    if !matches {
        job_service.append_log(job_id, &format!("delete_source_guard_mismatch: {}", source_rel.as_str()))?;
        return Ok(());
    }

    delete_source_unit(jail, source_root, source_rel, unit_type)
}

fn delete_source_unit(jail: &Jail, root: Root, rel: &RelativePath, unit_type: UnitType) -> Result<(), CoreError> {
    match unit_type {
        UnitType::Dir => jail.rmtree(root, rel).map_err(|e| e.into_core_error(false)),
        UnitType::File => jail.delete_file(root, rel).map_err(|e| e.into_core_error(false)),
    }
}
