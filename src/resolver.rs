//! Resource Resolver — translates addresses into store records and renders
//! the `system://` pseudo-addresses.
//!
//! `system://boot` expands the configured core-memory bundle plus a recent
//! view; `system://index` renders a compact grouped index; `system://recent[/N]`
//! lists the last N modified memories (default 10, max 100). The resolver is
//! pure over the store snapshot at call time.

use std::sync::Arc;

use crate::address::{make_uri, parse_address, Address};
use crate::errors::{PalaceError, Result};
use crate::store::Store;

pub struct Resolver {
    store: Arc<Store>,
}

impl Resolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn parse(&self, uri: &str) -> Result<Address> {
        parse_address(uri, &self.store.config.storage.valid_domains)
    }

    /// Render a `system://` view, or `None` when the address is a regular one.
    pub fn resolve_system(&self, addr: &Address) -> Result<Option<String>> {
        if !addr.is_system() {
            return Ok(None);
        }
        match addr.path.as_str() {
            "boot" => Ok(Some(self.boot_view()?)),
            "index" => Ok(Some(self.index_view()?)),
            "recent" => Ok(Some(self.recent_view(10)?)),
            path if path.starts_with("recent/") => {
                let suffix = &path["recent/".len()..];
                let limit: usize = suffix.parse().map_err(|_| {
                    PalaceError::InvalidArgument(
                        "invalid system://recent URI; use system://recent or system://recent/N"
                            .into(),
                    )
                })?;
                Ok(Some(self.recent_view(limit.clamp(1, 100))?))
            }
            other => Err(PalaceError::AddressNotFound(format!("system://{other}"))),
        }
    }

    /// Full formatted read of a memory: header, content, and child listing
    /// across every alias of the memory.
    pub fn render_memory(&self, addr: &Address) -> Result<String> {
        let resolved = self
            .store
            .get_memory_by_path(&addr.domain, &addr.path)?
            .ok_or_else(|| PalaceError::AddressNotFound(addr.uri()))?;

        let mut lines = Vec::new();
        lines.push("=".repeat(60));
        lines.push(String::new());
        lines.push(format!("MEMORY: {}", resolved.uri()));
        lines.push(format!("Memory ID: {}", resolved.memory.id));
        lines.push(format!("Priority: {}", resolved.priority));
        match &resolved.disclosure {
            Some(disclosure) => lines.push(format!("Disclosure: {disclosure}")),
            None => lines.push("Disclosure: (not set)".to_string()),
        }
        lines.push(String::new());
        lines.push("=".repeat(60));
        lines.push(String::new());
        lines.push(resolved.memory.content.clone());
        lines.push(String::new());

        let children = self.store.children_of_memory(resolved.memory.id)?;
        if !children.is_empty() {
            lines.push("=".repeat(60));
            lines.push(String::new());
            lines.push("CHILD MEMORIES (use read_memory with the URI to access)".to_string());
            lines.push(String::new());
            for child in &children {
                lines.push(format!("- URI: {}://{}", child.domain, child.path));
                lines.push(format!("  Priority: {}", child.priority));
                match &child.disclosure {
                    Some(disclosure) => lines.push(format!("  When to recall: {disclosure}")),
                    None => {
                        lines.push("  When to recall: (not set)".to_string());
                        lines.push(format!("  Snippet: {}", child.content_snippet));
                    }
                }
                lines.push(String::new());
            }
        }

        Ok(lines.join("\n"))
    }

    /// Breadcrumbs from the domain root down to the address.
    pub fn breadcrumbs(&self, addr: &Address) -> Vec<String> {
        let mut crumbs = vec![format!("{}://", addr.domain)];
        let mut prefix = String::new();
        for segment in addr.path.split('/').filter(|s| !s.is_empty()) {
            if prefix.is_empty() {
                prefix = segment.to_string();
            } else {
                prefix = format!("{prefix}/{segment}");
            }
            crumbs.push(make_uri(&addr.domain, &prefix));
        }
        crumbs
    }

    fn boot_view(&self) -> Result<String> {
        let core_uris = &self.store.config.storage.core_memory_uris;
        let mut rendered = Vec::new();
        let mut failed = Vec::new();

        for uri in core_uris {
            match self
                .parse(uri)
                .and_then(|addr| self.render_memory(&addr))
            {
                Ok(text) => rendered.push(text),
                Err(e) => failed.push(format!("- {uri}: {e}")),
            }
        }

        let mut out = Vec::new();
        out.push("# Core Memories".to_string());
        out.push(format!(
            "# Loaded: {}/{} memories",
            rendered.len(),
            core_uris.len()
        ));
        out.push(String::new());
        if !failed.is_empty() {
            out.push("## Failed to load:".to_string());
            out.extend(failed);
            out.push(String::new());
        }
        if rendered.is_empty() {
            out.push("(No core memories loaded yet.)".to_string());
        } else {
            out.push("## Contents:".to_string());
            out.push(String::new());
            out.push("For the full memory index, use: system://index".to_string());
            out.push("For recent memories, use: system://recent".to_string());
            out.extend(rendered);
        }

        // Recently modified memories ride along so the agent sees what changed.
        if let Ok(recent) = self.recent_view(5) {
            out.push(String::new());
            out.push("---".to_string());
            out.push(String::new());
            out.push(recent);
        }

        Ok(out.join("\n"))
    }

    fn index_view(&self) -> Result<String> {
        let paths = self.store.list_all_paths(None)?;

        let mut lines = Vec::new();
        lines.push("# Memory Index".to_string());
        lines.push(format!("# Total entries: {}", paths.len()));
        lines.push(
            "# Legend: [#ID] = memory id (same id = alias), [★N] = priority (lower = higher)"
                .to_string(),
        );
        lines.push(String::new());

        // Group by domain, then by top-level segment.
        let mut domains: std::collections::BTreeMap<
            String,
            std::collections::BTreeMap<String, Vec<&crate::store::memory::PathRecord>>,
        > = std::collections::BTreeMap::new();
        for record in &paths {
            let top_level = record
                .path
                .split('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("(root)")
                .to_string();
            domains
                .entry(record.domain.clone())
                .or_default()
                .entry(top_level)
                .or_default()
                .push(record);
        }

        for (domain, groups) in &domains {
            lines.push(format!("# DOMAIN: {domain}://"));
            lines.push(String::new());
            for (group, records) in groups {
                lines.push(format!("## {group}"));
                for record in records {
                    let marker = if record.priority > 0 {
                        format!(" [★{}]", record.priority)
                    } else {
                        String::new()
                    };
                    lines.push(format!("  - {} [#{}]{}", record.uri(), record.memory_id, marker));
                }
                lines.push(String::new());
            }
        }

        Ok(lines.join("\n"))
    }

    fn recent_view(&self, limit: usize) -> Result<String> {
        let recent = self.store.get_recent(limit)?;

        let mut lines = Vec::new();
        lines.push("# Recently Modified Memories".to_string());
        lines.push(format!(
            "# Showing: {} most recent entries (requested: {limit})",
            recent.len()
        ));
        lines.push(String::new());
        if recent.is_empty() {
            lines.push("(No memories found.)".to_string());
            return Ok(lines.join("\n"));
        }

        for (i, item) in recent.iter().enumerate() {
            // Minute precision is enough for a glance.
            let stamp = item
                .memory
                .updated_at
                .get(..16)
                .unwrap_or(&item.memory.updated_at)
                .replace('T', " ");
            lines.push(format!(
                "{}. {}  [★{}]  modified: {}",
                i + 1,
                item.uri(),
                item.priority,
                stamp
            ));
            match &item.disclosure {
                Some(disclosure) => lines.push(format!("   disclosure: {disclosure}")),
                None => lines.push("   disclosure: (NOT SET — consider adding one)".to_string()),
            }
            lines.push(String::new());
        }

        Ok(lines.join("\n"))
    }
}
