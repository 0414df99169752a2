//! Composition root — wires the store, guard, lane, ledger, worker, and
//! governance into one owned component graph, and implements the nine tool
//! operations on top of it.
//!
//! Nothing here is process-global: tests construct a fresh [`PalaceCore`] per
//! scenario. Guard blocks are surfaced as successes (`created=false` /
//! `updated=false` plus the guard verdict); only typed errors fail a call.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::config::PalaceConfig;
use crate::errors::{PalaceError, Result};
use crate::governance::{CleanupReviews, DecayScheduler, SleepScheduler};
use crate::guard::{evaluate_guard, GuardDecision, GuardProposal};
use crate::lane::{memory_key, path_key, WriteLane};
use crate::remote::RemoteClient;
use crate::resolver::Resolver;
use crate::retrieval::{SearchPipeline, SearchRequest};
use crate::session::{FlushTracker, SessionCache};
use crate::snapshot::SnapshotLedger;
use crate::store::Store;
use crate::worker::IndexWorker;

pub struct PalaceCore {
    pub config: Arc<PalaceConfig>,
    pub store: Arc<Store>,
    pub resolver: Resolver,
    pub remote: Arc<RemoteClient>,
    pub lane: WriteLane,
    pub ledger: SnapshotLedger,
    pub worker: Arc<IndexWorker>,
    pub reviews: CleanupReviews,
    pub decay: Arc<DecayScheduler>,
    pub sleep: Arc<SleepScheduler>,
    pub session_cache: SessionCache,
    pub flush_tracker: FlushTracker,
    session_id: String,
    flush_in_progress: AtomicBool,
}

/// Index enqueue stats reported on every content write.
#[derive(Debug, Default)]
pub struct EnqueueStats {
    pub queued: usize,
    pub deduped: usize,
    pub dropped: usize,
}

impl PalaceCore {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let config = Arc::clone(&store.config);
        let remote = Arc::new(RemoteClient::new(Arc::clone(&config)));
        let worker = IndexWorker::spawn(Arc::clone(&store), Arc::clone(&remote));
        let session_id = format!(
            "mcp_{}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );

        Arc::new(Self {
            resolver: Resolver::new(Arc::clone(&store)),
            lane: WriteLane::from_config(&config.lane),
            ledger: SnapshotLedger::new(Arc::clone(&store)),
            reviews: CleanupReviews::new(Arc::clone(&store)),
            decay: Arc::new(DecayScheduler::new(Arc::clone(&store))),
            sleep: Arc::new(SleepScheduler::new(&config.sleep)),
            session_cache: SessionCache::new(&config.session),
            flush_tracker: FlushTracker::new(&config.session),
            session_id,
            flush_in_progress: AtomicBool::new(false),
            worker,
            remote,
            store,
            config,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pipeline(&self) -> SearchPipeline {
        SearchPipeline::new(Arc::clone(&self.store), Arc::clone(&self.remote))
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    fn guard_fields(decision: &GuardDecision) -> Value {
        json!({
            "action": decision.action.as_str(),
            "method": decision.method,
            "reason": decision.reason,
            "confidence": decision.confidence,
            "target_id": decision.target_id,
            "target_uri": decision.target_uri,
            "degraded": decision.degraded,
            "degrade_reasons": decision.degrade_reasons,
        })
    }

    fn defer_index(&self) -> bool {
        self.config.index.defer_on_write
    }

    /// Enqueue reindex jobs for a write's index targets, tallying outcomes.
    fn enqueue_targets(&self, targets: &[i64], reason: &str) -> EnqueueStats {
        let mut stats = EnqueueStats::default();
        for memory_id in targets {
            match self.worker.enqueue_reindex_memory(*memory_id, reason) {
                Ok(outcome) if outcome.queued => stats.queued += 1,
                Ok(outcome) if outcome.deduped => stats.deduped += 1,
                Ok(_) => stats.dropped += 1,
                Err(e) => {
                    tracing::warn!(memory_id, error = %e, "index enqueue failed");
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    fn stats_fields(stats: &EnqueueStats, degrade_reasons: &mut Vec<String>) -> Value {
        if stats.dropped > 0 {
            crate::remote::push_degrade(degrade_reasons, "index_enqueue_dropped");
        }
        json!({
            "index_queued": stats.queued,
            "index_deduped": stats.deduped,
            "index_dropped": stats.dropped,
        })
    }

    async fn record_hit(
        &self,
        uri: &str,
        memory_id: Option<i64>,
        snippet: &str,
        priority: Option<i64>,
        source: &str,
    ) {
        self.session_cache
            .record_hit(&self.session_id, uri, memory_id, snippet, priority, source, None)
            .await;
    }

    async fn record_event(&self, message: &str) {
        self.flush_tracker
            .record_event(&self.session_id, message)
            .await;
    }

    fn write_address(&self, uri: &str) -> Result<Address> {
        let addr = self.resolver.parse(uri)?;
        if addr.is_system() {
            return Err(PalaceError::InvalidArgument(
                "system:// addresses are read-only".into(),
            ));
        }
        Ok(addr)
    }

    // ── read_memory ──────────────────────────────────────────────────────────

    pub async fn read_memory(
        &self,
        uri: &str,
        chunk_id: Option<i64>,
        range: Option<&str>,
        max_chars: Option<i64>,
    ) -> Result<Value> {
        let selectors = [chunk_id.is_some(), range.is_some(), max_chars.is_some()];
        let selector_count = selectors.iter().filter(|s| **s).count();
        if selector_count > 1 {
            return Err(PalaceError::InvalidArgument(
                "chunk_id, range, and max_chars are mutually exclusive".into(),
            ));
        }
        if let Some(chunk_id) = chunk_id {
            if chunk_id < 0 {
                return Err(PalaceError::InvalidArgument("chunk_id must be >= 0".into()));
            }
        }
        if let Some(max_chars) = max_chars {
            if max_chars < 1 {
                return Err(PalaceError::InvalidArgument("max_chars must be >= 1".into()));
            }
        }
        let parsed_range = range.map(parse_range_spec).transpose()?;

        let addr = self.resolver.parse(uri)?;
        if let Some(view) = self.resolver.resolve_system(&addr)? {
            if selector_count == 0 {
                return Ok(json!({"ok": true, "uri": addr.uri(), "source": "system", "content": view}));
            }
            let (selected, selection) = slice_content(
                &view,
                chunk_id,
                parsed_range,
                max_chars,
                &self.config.retrieval,
            )?;
            return Ok(json!({
                "ok": true,
                "uri": addr.uri(),
                "source": "system",
                "selection": selection,
                "content": selected,
            }));
        }

        let resolved = self
            .store
            .get_memory_by_path(&addr.domain, &addr.path)?
            .ok_or_else(|| PalaceError::AddressNotFound(addr.uri()))?;

        self.record_hit(
            &addr.uri(),
            Some(resolved.memory.id),
            &resolved.memory.content,
            Some(resolved.priority),
            "read_memory",
        )
        .await;
        self.record_event(&format!("read {}", addr.uri())).await;
        if let Err(e) = self.store.reinforce_access(&[resolved.memory.id]) {
            tracing::warn!(error = %e, "access reinforcement failed");
        }

        if selector_count == 0 {
            let rendered = self.resolver.render_memory(&addr)?;
            return Ok(json!({
                "ok": true,
                "uri": addr.uri(),
                "memory_id": resolved.memory.id,
                "source": "memory",
                "breadcrumbs": self.resolver.breadcrumbs(&addr),
                "content": rendered,
            }));
        }

        let (selected, selection) = slice_content(
            &resolved.memory.content,
            chunk_id,
            parsed_range,
            max_chars,
            &self.config.retrieval,
        )?;
        Ok(json!({
            "ok": true,
            "uri": addr.uri(),
            "memory_id": resolved.memory.id,
            "source": "memory",
            "selection": selection,
            "content": selected,
        }))
    }

    // ── create_memory ────────────────────────────────────────────────────────

    pub async fn create_memory(
        &self,
        parent_uri: &str,
        content: &str,
        priority: i64,
        title: Option<&str>,
        disclosure: Option<&str>,
    ) -> Result<Value> {
        if priority < 0 {
            return Err(PalaceError::InvalidArgument(
                "priority must be a non-negative integer".into(),
            ));
        }
        if let Some(title) = title {
            if !crate::address::is_valid_title(title) {
                return Err(PalaceError::InvalidArgument(
                    "title must only contain lowercase letters, digits, underscores, or hyphens"
                        .into(),
                ));
            }
        }
        if content.trim().is_empty() {
            return Err(PalaceError::InvalidArgument("content must not be empty".into()));
        }
        let parent = self.write_address(parent_uri)?;

        let lane_key = match title {
            Some(title) => path_key(&parent.domain, &format!("{}/{}", parent.path, title)),
            None => path_key(&parent.domain, &parent.path),
        };
        let defer = self.defer_index();

        let (decision, created) = self
            .lane
            .run(&lane_key, || async {
                // Guard → snapshot → mutate, all under the record lock so the
                // verdict can never go stale against a concurrent writer.
                let decision = evaluate_guard(
                    &self.store,
                    &self.remote,
                    &GuardProposal {
                        content,
                        domain: &parent.domain,
                        path_prefix: (!parent.path.is_empty()).then_some(parent.path.as_str()),
                        exclude_memory_id: None,
                    },
                )
                .await;
                if decision.blocks_create() {
                    return Ok((decision, None));
                }

                let created = self.store.create_memory(
                    &parent.domain,
                    &parent.path,
                    content,
                    priority,
                    title,
                    disclosure,
                    !defer,
                )?;
                self.ledger.capture_create(
                    &self.session_id,
                    &created.uri,
                    &created.domain,
                    &created.path,
                    created.id,
                    "create",
                    None,
                )?;
                Ok((decision, Some(created)))
            })
            .await?;

        let guard = Self::guard_fields(&decision);
        let Some(created) = created else {
            let mut message = format!(
                "Skipped: write guard blocked create_memory (action={}, method={})",
                decision.action.as_str(),
                decision.method
            );
            if let Some(target) = &decision.target_uri {
                message.push_str(&format!("; suggested_target={target}"));
            }
            return Ok(json!({
                "ok": true,
                "created": false,
                "message": message,
                "uri": decision.target_uri,
                "guard": guard,
                "index_queued": 0,
                "index_deduped": 0,
                "index_dropped": 0,
            }));
        };

        let mut degrade_reasons = decision.degrade_reasons.clone();
        let stats = if defer {
            self.enqueue_targets(&created.index_targets, "create_memory")
        } else {
            EnqueueStats::default()
        };
        let stats_fields = Self::stats_fields(&stats, &mut degrade_reasons);

        self.record_hit(&created.uri, Some(created.id), content, Some(priority), "create_memory")
            .await;
        self.record_event(&format!("create {}", created.uri)).await;
        self.maybe_auto_flush("create_memory").await;

        let mut payload = json!({
            "ok": true,
            "created": true,
            "message": format!("Success: memory created at '{}'", created.uri),
            "uri": created.uri,
            "memory_id": created.id,
            "guard": guard,
        });
        merge(&mut payload, stats_fields);
        payload["degrade_reasons"] = json!(degrade_reasons);
        payload["degraded"] = json!(!degrade_reasons.is_empty());
        Ok(payload)
    }

    // ── update_memory ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn update_memory(
        &self,
        uri: &str,
        old_string: Option<&str>,
        new_string: Option<&str>,
        append: Option<&str>,
        priority: Option<i64>,
        disclosure: Option<&str>,
    ) -> Result<Value> {
        let addr = self.write_address(uri)?;

        if old_string.is_some() && append.is_some() {
            return Err(PalaceError::InvalidArgument(
                "patch (old/new) and append modes are mutually exclusive".into(),
            ));
        }
        if old_string.is_some() != new_string.is_some() {
            return Err(PalaceError::InvalidArgument(
                "patch mode requires both old_string and new_string".into(),
            ));
        }
        if let Some(append) = append {
            if append.is_empty() {
                return Err(PalaceError::InvalidArgument(
                    "append must not be empty".into(),
                ));
            }
        }
        if old_string.is_none() && append.is_none() && priority.is_none() && disclosure.is_none() {
            return Err(PalaceError::InvalidArgument(format!(
                "no update fields provided for '{}'",
                addr.uri()
            )));
        }
        if let Some(priority) = priority {
            if priority < 0 {
                return Err(PalaceError::InvalidArgument(
                    "priority must be a non-negative integer".into(),
                ));
            }
        }

        let resolved = self
            .store
            .get_memory_by_path(&addr.domain, &addr.path)?
            .ok_or_else(|| PalaceError::AddressNotFound(addr.uri()))?;
        let current_id = resolved.memory.id;

        // Resolve the new content outside the lane; the patch re-validates
        // inside it against the then-current content.
        let defer = self.defer_index();
        let lane_key = memory_key(current_id);

        let (decision, update, new_content_opt) = self
            .lane
            .run(&lane_key, || async {
                let current = self
                    .store
                    .get_memory_by_path(&addr.domain, &addr.path)?
                    .ok_or_else(|| PalaceError::AddressNotFound(addr.uri()))?;

                let new_content: Option<String> = if let (Some(old), Some(new)) =
                    (old_string, new_string)
                {
                    if old == new {
                        return Err(PalaceError::InvalidArgument(
                            "old_string and new_string are identical; no change would be made"
                                .into(),
                        ));
                    }
                    let occurrences = current.memory.content.matches(old).count();
                    match occurrences {
                        0 => return Err(PalaceError::PatchNotFound(addr.uri())),
                        1 => Some(current.memory.content.replacen(old, new, 1)),
                        count => {
                            return Err(PalaceError::PatchAmbiguous {
                                uri: addr.uri(),
                                count,
                            })
                        }
                    }
                } else {
                    append.map(|tail| format!("{}{}", current.memory.content, tail))
                };

                let decision = match &new_content {
                    Some(content) => {
                        evaluate_guard(
                            &self.store,
                            &self.remote,
                            &GuardProposal {
                                content,
                                domain: &addr.domain,
                                path_prefix: addr.parent_path().filter(|p| !p.is_empty()),
                                exclude_memory_id: Some(current.memory.id),
                            },
                        )
                        .await
                    }
                    // Metadata-only updates bypass the ladder.
                    None => GuardDecision::bypass(),
                };

                let blocked = match decision.action {
                    crate::guard::GuardAction::Noop | crate::guard::GuardAction::Delete => {
                        new_content.is_some()
                    }
                    crate::guard::GuardAction::Update => {
                        new_content.is_some()
                            && decision
                                .target_id
                                .map(|target| target != current.memory.id)
                                .unwrap_or(false)
                    }
                    _ => false,
                };
                if blocked {
                    return Ok((decision, None, new_content));
                }

                // Snapshot BEFORE the mutation (first capture wins).
                if new_content.is_some() {
                    self.ledger
                        .capture_content(&self.session_id, &addr.domain, &addr.path)?;
                }
                if priority.is_some() || disclosure.is_some() {
                    self.ledger
                        .capture_meta(&self.session_id, &addr.domain, &addr.path)?;
                }

                let update = self.store.update_memory(
                    &addr.domain,
                    &addr.path,
                    new_content.as_deref(),
                    priority,
                    disclosure,
                    !defer,
                )?;
                Ok((decision, Some(update), new_content))
            })
            .await?;

        let guard = Self::guard_fields(&decision);
        let Some(update) = update else {
            return Ok(json!({
                "ok": true,
                "updated": false,
                "message": format!(
                    "Skipped: write guard blocked update_memory (action={}, method={})",
                    decision.action.as_str(),
                    decision.method
                ),
                "uri": addr.uri(),
                "guard": guard,
                "index_queued": 0,
                "index_deduped": 0,
                "index_dropped": 0,
            }));
        };

        let mut degrade_reasons = decision.degrade_reasons.clone();
        let stats = if defer && !update.index_targets.is_empty() {
            self.enqueue_targets(&update.index_targets, "update_memory")
        } else {
            EnqueueStats::default()
        };
        let stats_fields = Self::stats_fields(&stats, &mut degrade_reasons);

        let preview = new_content_opt.unwrap_or_else(|| {
            format!(
                "meta update priority={priority:?} disclosure={disclosure:?}"
            )
        });
        self.record_hit(
            &addr.uri(),
            Some(update.new_memory_id),
            &preview,
            priority,
            "update_memory",
        )
        .await;
        self.record_event(&format!("update {}", addr.uri())).await;
        self.maybe_auto_flush("update_memory").await;

        let mut payload = json!({
            "ok": true,
            "updated": true,
            "message": format!("Success: memory at '{}' updated", addr.uri()),
            "uri": addr.uri(),
            "memory_id": update.new_memory_id,
            "metadata_only": update.metadata_only,
            "guard": guard,
        });
        merge(&mut payload, stats_fields);
        payload["degrade_reasons"] = json!(degrade_reasons);
        payload["degraded"] = json!(!degrade_reasons.is_empty());
        Ok(payload)
    }

    // ── delete_memory ────────────────────────────────────────────────────────

    pub async fn delete_memory(&self, uri: &str) -> Result<Value> {
        let addr = self.write_address(uri)?;
        let resolved = self
            .store
            .get_memory_by_path(&addr.domain, &addr.path)?
            .ok_or_else(|| PalaceError::AddressNotFound(addr.uri()))?;

        let removed = self
            .lane
            .run(&path_key(&addr.domain, &addr.path), || async {
                self.ledger
                    .capture_delete(&self.session_id, &addr.domain, &addr.path)?;
                self.store.remove_path(&addr.domain, &addr.path)
            })
            .await?;

        self.record_hit(
            &addr.uri(),
            Some(resolved.memory.id),
            &format!("[deleted] {}", crate::store::memory::snippet(&resolved.memory.content, 200)),
            Some(resolved.priority),
            "delete_memory",
        )
        .await;
        self.record_event(&format!("delete {}", addr.uri())).await;
        self.maybe_auto_flush("delete_memory").await;

        Ok(json!({
            "ok": true,
            "deleted": true,
            "uri": removed.removed_uri,
            "memory_id": removed.memory_id,
            "surviving_paths": removed.surviving_paths,
            "memory_deprecated": removed.deprecated_now,
        }))
    }

    // ── add_alias ────────────────────────────────────────────────────────────

    pub async fn add_alias(
        &self,
        new_uri: &str,
        target_uri: &str,
        priority: i64,
        disclosure: Option<&str>,
    ) -> Result<Value> {
        if priority < 0 {
            return Err(PalaceError::InvalidArgument(
                "priority must be a non-negative integer".into(),
            ));
        }
        let new_addr = self.write_address(new_uri)?;
        let target_addr = self.write_address(target_uri)?;

        let target = self
            .store
            .get_memory_by_path(&target_addr.domain, &target_addr.path)?
            .ok_or_else(|| PalaceError::AddressNotFound(target_addr.uri()))?;

        // The guard runs for observability, but an alias to an existing
        // memory always proceeds: duplicates ARE the point of an alias.
        let decision = evaluate_guard(
            &self.store,
            &self.remote,
            &GuardProposal {
                content: &target.memory.content,
                domain: &new_addr.domain,
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;

        let alias = self
            .lane
            .run(&path_key(&new_addr.domain, &new_addr.path), || async {
                let alias = self.store.add_path(
                    &new_addr.domain,
                    &new_addr.path,
                    &target_addr.domain,
                    &target_addr.path,
                    priority,
                    disclosure,
                )?;
                self.ledger.capture_create(
                    &self.session_id,
                    &alias.new_uri,
                    &new_addr.domain,
                    &new_addr.path,
                    alias.memory_id,
                    "create_alias",
                    Some(&alias.target_uri),
                )?;
                Ok(alias)
            })
            .await?;

        self.record_hit(
            &alias.new_uri,
            Some(alias.memory_id),
            &format!("[alias] {} -> {}", alias.new_uri, alias.target_uri),
            Some(priority),
            "add_alias",
        )
        .await;
        self.record_event(&format!("add-alias {} -> {}", alias.new_uri, alias.target_uri))
            .await;

        Ok(json!({
            "ok": true,
            "created_alias": true,
            "uri": alias.new_uri,
            "target_uri": alias.target_uri,
            "memory_id": alias.memory_id,
            "guard": Self::guard_fields(&decision),
        }))
    }

    // ── search_memory ────────────────────────────────────────────────────────

    pub async fn search_memory(&self, request: &SearchRequest) -> Result<Value> {
        let include_session = request
            .include_session
            .unwrap_or(self.config.session.session_first_search);
        let session_hits = if include_session {
            self.session_cache
                .search(
                    &self.session_id,
                    &request.query,
                    request
                        .max_results
                        .unwrap_or(self.config.retrieval.default_max_results),
                )
                .await
        } else {
            Vec::new()
        };

        let response = self.pipeline().run(request, session_hits).await?;

        for item in &response.results {
            self.record_hit(
                &item.uri,
                item.memory_id,
                &item.snippet,
                Some(item.priority),
                "search_memory",
            )
            .await;
        }
        self.record_event(&format!("search '{}'", request.query)).await;

        Ok(serde_json::to_value(&response).map_err(|e| anyhow::anyhow!(e))?)
    }

    // ── compact_context ──────────────────────────────────────────────────────

    pub async fn compact_context(
        &self,
        reason: &str,
        force: bool,
        max_lines: usize,
    ) -> Result<Value> {
        if max_lines < 3 {
            return Err(PalaceError::InvalidArgument("max_lines must be >= 3".into()));
        }
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            return Err(PalaceError::InvalidArgument(
                "compaction already in progress for current session".into(),
            ));
        }
        let result = self.flush_session(reason, force, max_lines).await;
        self.flush_in_progress.store(false, Ordering::SeqCst);

        let mut payload = json!({
            "ok": true,
            "session_id": self.session_id,
            "reason": reason,
            "force": force,
        });
        merge(&mut payload, result?);
        Ok(payload)
    }

    async fn flush_session(&self, reason: &str, force: bool, max_lines: usize) -> Result<Value> {
        if !force && !self.flush_tracker.should_flush(&self.session_id).await {
            return Ok(json!({"flushed": false, "skip_reason": "threshold_not_reached"}));
        }
        let summary = self
            .flush_tracker
            .build_summary(&self.session_id, max_lines)
            .await;
        if summary.trim().is_empty() {
            return Ok(json!({"flushed": false, "skip_reason": "no_pending_events"}));
        }

        let gist =
            crate::gist::generate_gist(&self.remote, &self.config, &summary, 3, 280).await;
        let source_hash = crate::store::content_hash(&summary);
        let mut degrade_reasons = gist.degrade_reasons.clone();

        // Flush namespaces are auto-created the first time they are needed.
        let parent = self.write_address(&self.config.session.flush_parent_uri)?;
        self.ensure_parent_chain(&parent)?;

        let title = format!(
            "flush_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let content = format!(
            "# Session Flush\n- session_id: {}\n- reason: {}\n- gist_method: {}\n- quality: {:.3}\n- source_hash: {}\n\n## Gist\n{}\n\n## Trace\n{}",
            self.session_id,
            reason,
            gist.gist_method,
            gist.quality,
            source_hash,
            if gist.gist_text.is_empty() { "(gist unavailable)" } else { &gist.gist_text },
            summary,
        );

        let defer = self.defer_index();
        let priority = self.config.session.flush_priority;
        let created = self
            .lane
            .run(&path_key(&parent.domain, &parent.path), || async {
                let created = self.store.create_memory(
                    &parent.domain,
                    &parent.path,
                    &content,
                    priority,
                    Some(&title),
                    Some("Session compaction summary"),
                    !defer,
                )?;
                self.ledger.capture_create(
                    &self.session_id,
                    &created.uri,
                    &created.domain,
                    &created.path,
                    created.id,
                    "create",
                    None,
                )?;
                Ok(created)
            })
            .await?;

        self.store.upsert_memory_gist(
            created.id,
            if gist.gist_text.is_empty() { &summary } else { &gist.gist_text },
            &source_hash,
            &gist.gist_method,
            gist.quality,
        )?;

        let stats = if defer {
            self.enqueue_targets(&created.index_targets, "compact_context")
        } else {
            EnqueueStats::default()
        };
        let stats_fields = Self::stats_fields(&stats, &mut degrade_reasons);

        self.flush_tracker.mark_flushed(&self.session_id).await;
        self.record_hit(&created.uri, Some(created.id), &content, Some(priority), "compact_context")
            .await;

        let mut payload = json!({
            "flushed": true,
            "uri": created.uri,
            "gist_method": gist.gist_method,
            "quality": gist.quality,
            "source_hash": source_hash,
            "gist_persisted": true,
        });
        merge(&mut payload, stats_fields);
        payload["degrade_reasons"] = json!(degrade_reasons);
        Ok(payload)
    }

    /// Create every missing segment of a flush namespace path.
    fn ensure_parent_chain(&self, parent: &Address) -> Result<()> {
        if parent.path.is_empty() {
            return Ok(());
        }
        let mut prefix = String::new();
        for segment in parent.path.split('/') {
            let current = if prefix.is_empty() {
                segment.to_string()
            } else {
                format!("{prefix}/{segment}")
            };
            if self
                .store
                .get_memory_by_path(&parent.domain, &current)?
                .is_none()
            {
                self.store.create_memory(
                    &parent.domain,
                    &prefix,
                    &format!(
                        "Flush namespace: {}",
                        crate::address::make_uri(&parent.domain, &current)
                    ),
                    self.config.session.flush_priority.max(1),
                    Some(segment),
                    Some("Session flush namespace"),
                    false,
                )?;
            }
            prefix = current;
        }
        Ok(())
    }

    async fn maybe_auto_flush(&self, reason: &str) {
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.flush_tracker.should_flush(&self.session_id).await {
            if let Err(e) = self.flush_session(reason, false, 12).await {
                tracing::warn!(error = %e, "auto flush failed");
            }
        }
        self.flush_in_progress.store(false, Ordering::SeqCst);
    }

    // ── rebuild_index / index_status ─────────────────────────────────────────

    pub async fn rebuild_index(
        &self,
        memory_id: Option<i64>,
        reason: &str,
        wait: bool,
        timeout_secs: u64,
        sleep_consolidation: bool,
    ) -> Result<Value> {
        if let Some(memory_id) = memory_id {
            if memory_id <= 0 {
                return Err(PalaceError::InvalidArgument(
                    "memory_id must be a positive integer".into(),
                ));
            }
            if sleep_consolidation {
                return Err(PalaceError::InvalidArgument(
                    "memory_id is incompatible with sleep_consolidation=true".into(),
                ));
            }
        }

        let (task_type, outcome) = if sleep_consolidation {
            ("sleep_consolidation", self.worker.enqueue_sleep_consolidation(reason)?)
        } else if let Some(memory_id) = memory_id {
            ("reindex_memory", self.worker.enqueue_reindex_memory(memory_id, reason)?)
        } else {
            ("rebuild_index", self.worker.enqueue_rebuild(reason)?)
        };

        if outcome.dropped {
            return Err(PalaceError::QueueFull);
        }

        let mut payload = json!({
            "ok": true,
            "task_type": task_type,
            "memory_id": memory_id,
            "reason": reason,
            "job_id": outcome.job_id,
            "queued": outcome.queued,
            "deduped": outcome.deduped,
            "dropped": outcome.dropped,
        });

        if wait {
            let (job, timed_out) = self
                .worker
                .wait_for_job(
                    &outcome.job_id,
                    Duration::from_secs(timeout_secs.clamp(1, 600)),
                )
                .await?;
            payload["wait_result"] = if timed_out {
                json!({"ok": false, "reason": "wait_timeout", "job": job})
            } else {
                json!({"ok": true, "job": job})
            };
        }

        payload["worker"] = serde_json::to_value(self.worker.status())
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(payload)
    }

    pub async fn index_status(&self) -> Result<Value> {
        let worker = self.worker.status();
        let lane = self.lane.status();
        let gists = self.store.gist_stats()?;
        let vitality = self.store.vitality_stats()?;
        let memory_count: i64 = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE deprecated = 0",
                [],
                |r| r.get(0),
            )?
        };

        Ok(json!({
            "ok": true,
            "index_available": true,
            "memory_count": memory_count,
            "worker": serde_json::to_value(&worker).map_err(|e| anyhow::anyhow!(e))?,
            "write_lane": serde_json::to_value(&lane).map_err(|e| anyhow::anyhow!(e))?,
            "gist_stats": serde_json::to_value(&gists).map_err(|e| anyhow::anyhow!(e))?,
            "vitality_stats": serde_json::to_value(&vitality).map_err(|e| anyhow::anyhow!(e))?,
            "sleep_consolidation": self.sleep.status().await,
            "vitality_decay": self.decay.status().await,
            "timestamp": Store::now_iso(),
        }))
    }
}

fn merge(target: &mut Value, source: Value) {
    if let (Some(target_map), Value::Object(source_map)) = (target.as_object_mut(), source) {
        for (key, value) in source_map {
            target_map.insert(key, value);
        }
    }
}

fn parse_range_spec(raw: &str) -> Result<(usize, usize)> {
    let text = raw.trim();
    let separator = if text.contains(':') { ':' } else { '-' };
    let mut parts = text.splitn(2, separator);
    let start: usize = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| {
            PalaceError::InvalidArgument("invalid range; use start:end (e.g. 0:500)".into())
        })?;
    let end: usize = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| {
            PalaceError::InvalidArgument("invalid range; use start:end (e.g. 0:500)".into())
        })?;
    if end <= start {
        return Err(PalaceError::InvalidArgument(
            "invalid range: end must be greater than start".into(),
        ));
    }
    Ok((start, end))
}

fn slice_content(
    content: &str,
    chunk_id: Option<i64>,
    range: Option<(usize, usize)>,
    max_chars: Option<i64>,
    retrieval: &crate::config::RetrievalConfig,
) -> Result<(String, Value)> {
    let chars: Vec<char> = content.chars().collect();
    let total = chars.len();
    let (mode, start, end) = if let Some(chunk_id) = chunk_id {
        let stride = retrieval
            .chunk_size
            .saturating_sub(retrieval.chunk_overlap)
            .max(1);
        let start = chunk_id as usize * stride;
        if start >= total {
            return Err(PalaceError::InvalidArgument(format!(
                "chunk_id={chunk_id} is out of range for content length {total}"
            )));
        }
        ("chunk", start, (start + retrieval.chunk_size).min(total))
    } else if let Some((start, end)) = range {
        if start >= total {
            return Err(PalaceError::InvalidArgument(format!(
                "range start {start} is out of range for content length {total}"
            )));
        }
        ("range", start, end.min(total))
    } else if let Some(max_chars) = max_chars {
        ("max_chars", 0, (max_chars as usize).min(total))
    } else {
        ("full", 0, total)
    };

    let selected: String = chars[start..end].iter().collect();
    let selection = json!({
        "mode": mode,
        "start": start,
        "end": end,
        "selected_chars": end - start,
        "total_chars": total,
    });
    Ok((selected, selection))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core() -> Arc<PalaceCore> {
        let config = Arc::new(PalaceConfig::default());
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        let store = Arc::new(Store::new(conn, config));
        PalaceCore::new(store)
    }

    #[tokio::test]
    async fn create_and_read_round_trip() {
        let core = test_core();
        let created = core
            .create_memory("core://", "Prefer concise code", 1, Some("style"), Some("when coding"))
            .await
            .unwrap();
        assert_eq!(created["created"], true);
        assert_eq!(created["uri"], "core://style");
        assert_eq!(created["guard"]["action"], "ADD");

        let read = core.read_memory("core://style", None, None, None).await.unwrap();
        assert_eq!(read["ok"], true);
        assert!(read["content"].as_str().unwrap().contains("Prefer concise code"));
    }

    #[tokio::test]
    async fn duplicate_create_is_guard_noop_success() {
        let core = test_core();
        core.create_memory("core://", "Prefer concise code", 1, Some("style"), None)
            .await
            .unwrap();

        let second = core
            .create_memory("core://", "Prefer concise code", 1, Some("style2"), None)
            .await
            .unwrap();
        assert_eq!(second["ok"], true);
        assert_eq!(second["created"], false);
        assert_eq!(second["guard"]["action"], "NOOP");
        assert_eq!(second["guard"]["target_uri"], "core://style");
        let method = second["guard"]["method"].as_str().unwrap();
        assert!(method == "embedding" || method == "keyword");
    }

    #[tokio::test]
    async fn patch_semantics_enforced() {
        let core = test_core();
        core.create_memory("notes://", "alpha beta alpha", 0, Some("r1"), None)
            .await
            .unwrap();

        // Ambiguous: the old string occurs twice.
        let err = core
            .update_memory("notes://r1", Some("alpha"), Some("gamma"), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "patch_ambiguous");

        // Not found.
        let err = core
            .update_memory("notes://r1", Some("zeta"), Some("gamma"), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "patch_not_found");

        // Unique patch applies.
        let updated = core
            .update_memory("notes://r1", Some("beta"), Some("gamma"), None, None, None)
            .await
            .unwrap();
        assert_eq!(updated["updated"], true);
        let read = core.read_memory("notes://r1", None, None, None).await.unwrap();
        assert!(read["content"].as_str().unwrap().contains("alpha gamma alpha"));
    }

    #[tokio::test]
    async fn meta_update_bypasses_guard() {
        let core = test_core();
        core.create_memory("core://", "body", 0, Some("doc"), None)
            .await
            .unwrap();
        let updated = core
            .update_memory("core://doc", None, None, None, Some(5), Some("later"))
            .await
            .unwrap();
        assert_eq!(updated["guard"]["action"], "BYPASS");
        assert_eq!(updated["metadata_only"], true);
        assert_eq!(updated["index_queued"], 0);
    }

    #[tokio::test]
    async fn delete_reports_surviving_paths() {
        let core = test_core();
        core.create_memory("core://", "shared body", 0, Some("origin"), None)
            .await
            .unwrap();
        core.add_alias("notes://spare", "core://origin", 0, None)
            .await
            .unwrap();

        let deleted = core.delete_memory("core://origin").await.unwrap();
        assert_eq!(deleted["deleted"], true);
        assert_eq!(deleted["surviving_paths"], json!(["notes://spare"]));
        assert_eq!(deleted["memory_deprecated"], false);

        let second = core.delete_memory("notes://spare").await.unwrap();
        assert_eq!(second["surviving_paths"], json!([]));
        assert_eq!(second["memory_deprecated"], true);
    }

    #[tokio::test]
    async fn alias_proceeds_despite_duplicate_guard_signal() {
        let core = test_core();
        core.create_memory("core://", "aliased body", 0, Some("origin"), None)
            .await
            .unwrap();
        let alias = core
            .add_alias("notes://extra", "core://origin", 1, Some("alias view"))
            .await
            .unwrap();
        assert_eq!(alias["created_alias"], true);
        assert_eq!(alias["target_uri"], "core://origin");
        // The guard saw the duplicate but did not block.
        assert_eq!(alias["guard"]["action"], "NOOP");
    }

    #[tokio::test]
    async fn read_slice_modes_are_exclusive() {
        let core = test_core();
        core.create_memory("core://", &"x".repeat(2000), 0, Some("big"), None)
            .await
            .unwrap();

        let err = core
            .read_memory("core://big", Some(0), Some("0:10"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let chunk = core.read_memory("core://big", Some(0), None, None).await.unwrap();
        assert_eq!(chunk["selection"]["mode"], "chunk");
        assert_eq!(chunk["selection"]["start"], 0);

        let range = core
            .read_memory("core://big", None, Some("10:20"), None)
            .await
            .unwrap();
        assert_eq!(range["selection"]["mode"], "range");
        assert_eq!(range["content"].as_str().unwrap().len(), 10);

        let capped = core.read_memory("core://big", None, None, Some(5)).await.unwrap();
        assert_eq!(capped["content"].as_str().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn compact_context_flushes_and_persists_gist() {
        let core = test_core();
        core.create_memory("core://", "first note", 0, Some("n1"), None)
            .await
            .unwrap();
        core.create_memory("core://", "second note", 0, Some("n2"), None)
            .await
            .unwrap();

        let result = core.compact_context("manual", true, 12).await.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["flushed"], true);
        let uri = result["uri"].as_str().unwrap();
        assert!(uri.starts_with("notes://flush_"));
        assert!(!result["gist_method"].as_str().unwrap().is_empty());
        assert_eq!(result["source_hash"].as_str().unwrap().len(), 64);

        // Nothing pending: a second unforced flush is a no-op.
        let second = core.compact_context("manual", false, 12).await.unwrap();
        assert_eq!(second["flushed"], false);
    }

    #[tokio::test]
    async fn rebuild_index_wait_reports_job() {
        let core = test_core();
        core.create_memory("core://", "rebuild me", 0, Some("doc"), None)
            .await
            .unwrap();

        let result = core
            .rebuild_index(None, "test", true, 10, false)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["task_type"], "rebuild_index");
        assert_eq!(result["wait_result"]["ok"], true);
        assert_eq!(result["wait_result"]["job"]["state"], "succeeded");
    }

    #[tokio::test]
    async fn rebuild_rejects_conflicting_arguments() {
        let core = test_core();
        let err = core
            .rebuild_index(Some(1), "test", false, 5, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }

    #[tokio::test]
    async fn index_status_shape() {
        let core = test_core();
        let status = core.index_status().await.unwrap();
        assert_eq!(status["ok"], true);
        assert!(status["worker"]["queue_capacity"].as_u64().unwrap() > 0);
        assert!(status["write_lane"]["global_concurrency"].as_u64().unwrap() >= 1);
        assert!(status["vitality_stats"]["threshold"].as_f64().is_some());
    }

    #[tokio::test]
    async fn search_records_session_hits() {
        let core = test_core();
        core.create_memory("core://", "searchable body text", 0, Some("doc"), None)
            .await
            .unwrap();

        let request = SearchRequest {
            query: "searchable body".into(),
            mode: Some("keyword".into()),
            max_results: Some(5),
            candidate_multiplier: Some(4),
            include_session: Some(false),
            filters: Default::default(),
        };
        let first = core.search_memory(&request).await.unwrap();
        assert_eq!(first["ok"], true);
        assert!(first["counts"]["returned"].as_u64().unwrap() > 0);

        // The hit is now in the session ring and merges first.
        let with_session = SearchRequest {
            include_session: Some(true),
            ..request
        };
        let second = core.search_memory(&with_session).await.unwrap();
        assert!(second["counts"]["session"].as_u64().unwrap() > 0);
        assert_eq!(second["results"][0]["source"], "session");
    }

    #[tokio::test]
    async fn lane_timeout_surfaces_typed_error() {
        let config = {
            let mut c = PalaceConfig::default();
            c.lane.wait_timeout_ms = 50;
            Arc::new(c)
        };
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        let store = Arc::new(Store::new(conn, config));
        let core = PalaceCore::new(store);

        core.create_memory("core://", "body", 0, Some("doc"), None)
            .await
            .unwrap();
        let resolved = core.store.get_memory_by_path("core", "doc").unwrap().unwrap();

        // Hold the record lock so the update cannot be admitted.
        let ticket = core.lane.admit(&memory_key(resolved.memory.id)).await.unwrap();
        let err = core
            .update_memory("core://doc", None, None, Some("tail"), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "lane_timeout");
        drop(ticket);
    }
}
