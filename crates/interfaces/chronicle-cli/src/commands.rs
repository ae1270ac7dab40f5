use anyhow::{bail, Context, Result};
use chronicle_core::{EndpointId, Fact, Target, TargetId, Timestamp};
use chronicle_persistence::{RecordStore, TargetDirectory, TrackerStore};
use chronicle_pipeline::RunSummary;

use crate::{format_instant, Runtime};

pub fn cmd_target_add(
    rt: &Runtime,
    id: TargetId,
    scopes: Vec<String>,
    token: Option<String>,
    inactive: bool,
) -> Result<Target> {
    let mut target = Target::new(id).with_scopes(scopes);
    target.access_token = token;
    target.active = !inactive;
    rt.store.upsert_target(&target)?;
    println!(
        ":: Target {} saved ({} scopes, {})",
        target.id,
        target.scopes.len(),
        if target.active { "active" } else { "inactive" }
    );
    Ok(target)
}

pub fn cmd_target_list(rt: &Runtime) -> Result<()> {
    let targets = rt.store.list_targets()?;
    if targets.is_empty() {
        println!("No targets found.");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<8} {:<40}", "TARGET", "ACTIVE", "CREDS", "SCOPES");
    println!("{:-<20} {:-<8} {:-<8} {:-<40}", "", "", "", "");
    for t in targets {
        let scopes: Vec<&str> = t.scopes.iter().map(String::as_str).collect();
        println!(
            "{:<20} {:<8} {:<8} {:<40}",
            t.id.to_string(),
            t.active,
            if t.credentials_valid { "valid" } else { "invalid" },
            scopes.join(",")
        );
    }
    Ok(())
}

/// Deletes the target and retires everything still live for it.
pub fn cmd_target_remove(rt: &Runtime, id: TargetId) -> Result<usize> {
    if !rt.store.remove_target(id)? {
        bail!("Target '{}' not found", id);
    }
    let retired = rt
        .store
        .retire_target(id, rt.engine.now())
        .with_context(|| format!("Failed to retire records of {}", id))?;
    println!(":: Target {} removed, {} records retired", id, retired);
    Ok(retired)
}

pub fn cmd_schedule(
    rt: &Runtime,
    target: TargetId,
    endpoint: &str,
    at: Option<Timestamp>,
) -> Result<()> {
    let endpoint = EndpointId::new(endpoint);
    if rt.adapters.get(&endpoint).is_none() {
        bail!("Endpoint '{}' is not configured", endpoint);
    }
    let at = at.unwrap_or_else(|| rt.engine.now());
    let tracker = rt.engine.trackers().schedule(target, &endpoint, at, None)?;
    println!(
        ":: {}/{} is {} for {}",
        target,
        endpoint,
        tracker.status,
        format_instant(tracker.scheduled_at)
    );
    Ok(())
}

pub fn cmd_bootstrap(rt: &Runtime) -> Result<usize> {
    let covered = rt.scheduler().bootstrap()?;
    println!(":: {} target/endpoint pairs scheduled", covered);
    Ok(covered)
}

pub async fn cmd_run(rt: &Runtime) -> Result<RunSummary> {
    println!(":: Running due trackers...");
    let summary = rt.scheduler().run_due(rt.engine.now()).await?;

    println!("\n:: Run Result");
    println!("   Attempted: {}", summary.attempted);
    println!("   Succeeded: {}", summary.succeeded);
    println!("   Failed:    {}", summary.failed);
    println!("   Skipped:   {}", summary.skipped);
    if summary.unknown_endpoints > 0 {
        println!("   Unknown:   {} (endpoint not configured)", summary.unknown_endpoints);
    }
    Ok(summary)
}

pub async fn cmd_watch(rt: &Runtime) -> Result<()> {
    let interval = rt.config.poll_interval();
    println!(":: Watching every {:?} (ctrl-c to stop)", interval);
    rt.scheduler()
        .run_forever(interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;
    println!(":: Stopped.");
    Ok(())
}

pub fn cmd_trackers(rt: &Runtime) -> Result<()> {
    let mut trackers = rt.store.list_unfinished()?;
    if trackers.is_empty() {
        println!("No unfinished trackers.");
        return Ok(());
    }
    trackers.sort_by_key(|t| t.scheduled_at);

    println!("{:<20} {:<24} {:<10} {:<26}", "TARGET", "ENDPOINT", "STATUS", "SCHEDULED");
    println!("{:-<20} {:-<24} {:-<10} {:-<26}", "", "", "", "");
    for t in trackers {
        println!(
            "{:<20} {:<24} {:<10} {:<26}",
            t.target.to_string(),
            t.endpoint.as_str(),
            t.status.to_string(),
            format_instant(t.scheduled_at)
        );
    }
    Ok(())
}

pub fn cmd_history(rt: &Runtime, target: TargetId, endpoint: &str, limit: usize) -> Result<()> {
    let history = rt
        .store
        .history(target, &EndpointId::new(endpoint), limit)?;
    if history.is_empty() {
        println!("No finished trackers for {}/{}.", target, endpoint);
        return Ok(());
    }

    println!("{:<26} {:<22} {}", "ENDED", "STATUS", "DETAIL");
    println!("{:-<26} {:-<22} {:-<30}", "", "", "");
    for t in history {
        let ended = t
            .sync_ended_at
            .map(format_instant)
            .unwrap_or_else(|| "-".to_string());
        println!("{:<26} {:<22} {}", ended, t.status.to_string(), t.detail);
    }
    Ok(())
}

/// Prints the versions of `kind` that were live for `target` at `at`.
pub fn cmd_records(
    rt: &Runtime,
    kind: &str,
    target: TargetId,
    at: Option<Timestamp>,
) -> Result<Vec<Fact>> {
    let at = at.unwrap_or_else(|| rt.engine.now());
    let facts = rt.store.get_all_live(kind, target, at)?;
    println!(
        ":: {} {} records for {} as of {}",
        facts.len(),
        kind,
        target,
        format_instant(at)
    );
    for fact in &facts {
        let attributes = serde_json::to_string(&fact.attributes)?;
        println!(
            "   {:<24} since {:<22} {}",
            fact.key.to_string(),
            format_instant(fact.life.start),
            attributes
        );
    }
    Ok(facts)
}
