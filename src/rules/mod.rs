//! Rule Compiler.
//!
//! Merges the custom blacklist, the enabled categories and the whitelist into
//! one set of blocked domains, writes it as Unbound `local-zone` directives
//! and asks the resolver to reload.
//!
//!   `*.ads.example.com`  becomes `ads.example.com`
//!   `Tracker.NET.`       becomes `tracker.net`
//!
//! An enabled whitelist entry always wins, however many sources block the
//! same domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::resolver::ResolverControl;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRule {
    #[serde(alias = "domainPattern", alias = "pattern")]
    pub domain: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistEntry {
    #[serde(alias = "domainPattern", alias = "pattern")]
    pub domain: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategorySet {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleBundle {
    #[serde(default)]
    pub blacklist: Vec<BlockRule>,
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
    #[serde(default)]
    pub categories: Vec<CategorySet>,
}

fn default_enabled() -> bool { true }

/// Deduplicated, whitelist-filtered block set. Ordered so the generated file
/// is stable for identical input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledRuleSet {
    pub domains: BTreeSet<String>,
    /// Patterns dropped because they are not valid domain names.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileOutcome {
    pub ok: bool,
    pub message: String,
    pub domains: usize,
}

/// Strip one leading `*.`, the trailing root dot and surrounding space; lowercase.
pub fn normalize_pattern(pattern: &str) -> String {
    let p = pattern.trim();
    let p = p.strip_prefix("*.").unwrap_or(p);
    p.trim_end_matches('.').to_lowercase()
}

/// Only plain hostnames may reach the directive file; anything else could
/// break out of the quoted zone name.
pub fn is_valid_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

pub fn compile(bundle: &RuleBundle) -> CompiledRuleSet {
    let whitelist: HashSet<String> = bundle
        .whitelist
        .iter()
        .filter(|w| w.enabled)
        .map(|w| normalize_pattern(&w.domain))
        .collect();

    let blacklist = bundle
        .blacklist
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.domain.as_str());
    let categories = bundle
        .categories
        .iter()
        .filter(|c| c.enabled)
        .flat_map(|c| c.domains.iter().map(String::as_str));

    let mut compiled = CompiledRuleSet::default();
    for pattern in blacklist.chain(categories) {
        let domain = normalize_pattern(pattern);
        if whitelist.contains(&domain) {
            continue;
        }
        if !is_valid_domain(&domain) {
            if !domain.is_empty() {
                compiled.rejected.push(pattern.to_string());
            }
            continue;
        }
        compiled.domains.insert(domain);
    }
    compiled
}

/// Full contents of the managed directive file.
pub fn render(set: &CompiledRuleSet, generated_at: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(64 + set.domains.len() * 48);
    out.push_str("# Managed by resolver-bridge. DO NOT EDIT: regenerated on every rule change.\n");
    out.push_str(&format!("# Generated: {}\n", generated_at.to_rfc3339()));
    out.push_str(&format!("# Domains: {}\n", set.domains.len()));
    out.push_str("server:\n");
    for domain in &set.domains {
        out.push_str(&format!("    local-zone: \"{domain}.\" always_refuse\n"));
    }
    out
}

pub struct RuleCompiler {
    path: PathBuf,
    control: Arc<ResolverControl>,
    /// Serializes regeneration so concurrent bundles never interleave.
    write_lock: Mutex<()>,
}

impl RuleCompiler {
    pub fn new(path: impl Into<PathBuf>, control: Arc<ResolverControl>) -> Self {
        Self { path: path.into(), control, write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compile, rewrite the directive file, reload. Failures are reported in
    /// the outcome, never returned as errors. A failed reload leaves the new
    /// file in place: rules are staged but not yet active.
    pub async fn apply(&self, bundle: &RuleBundle) -> CompileOutcome {
        let compiled = compile(bundle);
        let count = compiled.domains.len();
        if !compiled.rejected.is_empty() {
            tracing::warn!("Skipping {} invalid rule patterns: {:?}", compiled.rejected.len(), compiled.rejected);
        }

        let _guard = self.write_lock.lock().await;

        if let Err(e) = write_replace(&self.path, &render(&compiled, Utc::now())).await {
            tracing::error!("Failed to write rule file {}: {}", self.path.display(), e);
            return CompileOutcome {
                ok: false,
                message: format!("Failed to write {}: {}", self.path.display(), e),
                domains: 0,
            };
        }
        tracing::info!("Wrote {} blocked domains to {}", count, self.path.display());

        match self.control.reload().await {
            Ok(_) => CompileOutcome {
                ok: true,
                message: format!("Applied {count} blocked domains"),
                domains: count,
            },
            Err(e) => {
                tracing::warn!("Rules written but resolver reload failed: {}", e);
                CompileOutcome {
                    ok: false,
                    message: format!("Wrote {count} blocked domains but resolver reload failed: {e}"),
                    domains: count,
                }
            }
        }
    }
}

/// Write to a sibling temp file and rename over the target.
async fn write_replace(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(d: &str) -> BlockRule {
        BlockRule { domain: d.to_string(), enabled: true, category: None }
    }

    fn allow(d: &str) -> WhitelistEntry {
        WhitelistEntry { domain: d.to_string(), enabled: true }
    }

    fn category(name: &str, enabled: bool, domains: &[&str]) -> CategorySet {
        CategorySet {
            name: name.to_string(),
            enabled,
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("*.Ads.Example.com"), "ads.example.com");
        assert_eq!(normalize_pattern("  tracker.net. "), "tracker.net");
        // Only one leading wildcard is stripped.
        assert_eq!(normalize_pattern("*.*.x.com"), "*.x.com");
    }

    #[test]
    fn test_merge_and_dedup() {
        let bundle = RuleBundle {
            blacklist: vec![block("ads.com"), block("*.ADS.com"), block("t.net")],
            whitelist: vec![],
            categories: vec![category("ads", true, &["ads.com", "doubleclick.net"])],
        };
        let set = compile(&bundle);
        let got: Vec<&str> = set.domains.iter().map(String::as_str).collect();
        assert_eq!(got, vec!["ads.com", "doubleclick.net", "t.net"]);
    }

    #[test]
    fn test_whitelist_beats_every_source() {
        let bundle = RuleBundle {
            blacklist: vec![block("shared.com"), block("*.shared.com"), block("other.com")],
            whitelist: vec![allow("*.Shared.com.")],
            categories: vec![
                category("a", true, &["shared.com"]),
                category("b", true, &["SHARED.COM"]),
            ],
        };
        let set = compile(&bundle);
        assert!(!set.domains.contains("shared.com"));
        assert!(set.domains.contains("other.com"));
    }

    #[test]
    fn test_disabled_entries_ignored() {
        let mut off = block("off.com");
        off.enabled = false;
        let mut disabled_allow = allow("kept.com");
        disabled_allow.enabled = false;
        let bundle = RuleBundle {
            blacklist: vec![off, block("kept.com")],
            whitelist: vec![disabled_allow],
            categories: vec![category("social", false, &["social.com"])],
        };
        let set = compile(&bundle);
        let got: Vec<&str> = set.domains.iter().map(String::as_str).collect();
        assert_eq!(got, vec!["kept.com"]);
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let bundle = RuleBundle {
            blacklist: vec![block("evil.com\" redirect"), block("*."), block("ok.com")],
            ..Default::default()
        };
        let set = compile(&bundle);
        assert_eq!(set.domains.len(), 1);
        assert_eq!(set.rejected, vec!["evil.com\" redirect".to_string()]);
    }

    #[test]
    fn test_render_format() {
        let bundle = RuleBundle { blacklist: vec![block("ads.com")], ..Default::default() };
        let text = render(&compile(&bundle), Utc::now());
        assert!(text.starts_with("# Managed by resolver-bridge. DO NOT EDIT"));
        assert!(text.contains("# Generated: "));
        assert!(text.contains("server:\n    local-zone: \"ads.com.\" always_refuse\n"));
    }

    #[test]
    fn test_render_empty_has_no_directives() {
        let text = render(&CompiledRuleSet::default(), Utc::now());
        assert!(!text.contains("local-zone"));
    }

    #[test]
    fn test_bundle_from_dashboard_json() {
        let bundle: RuleBundle = serde_json::from_value(serde_json::json!({
            "blacklist": [{"domainPattern": "*.ads.com", "enabled": true, "category": "custom"}],
            "whitelist": [{"domain": "ok.ads.com"}],
            "categories": [{"name": "malware", "enabled": true, "domains": ["bad.net"]}]
        }))
        .unwrap();
        assert_eq!(bundle.blacklist[0].domain, "*.ads.com");
        assert!(bundle.whitelist[0].enabled);
        assert_eq!(compile(&bundle).domains.len(), 2);
    }

    struct ReloadOk;

    #[async_trait::async_trait]
    impl crate::exec::CommandRunner for ReloadOk {
        async fn run(
            &self,
            _program: &str,
            _args: &[&str],
            _timeout: std::time::Duration,
        ) -> Result<crate::exec::CommandOutput, crate::exec::CommandError> {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            Ok(crate::exec::CommandOutput { stdout: "ok\n".into(), stderr: String::new() })
        }
    }

    fn without_timestamp(text: &str) -> String {
        text.lines().filter(|l| !l.starts_with("# Generated: ")).collect::<Vec<_>>().join("\n")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_apply_leaves_one_whole_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.conf");
        let control = Arc::new(ResolverControl::new(
            Arc::new(ReloadOk),
            "unbound-control",
            std::time::Duration::from_secs(1),
        ));
        let compiler = Arc::new(RuleCompiler::new(path.clone(), control));

        let bundles: Vec<RuleBundle> = (0..8)
            .map(|i| RuleBundle {
                blacklist: (0..50).map(|j| block(&format!("b{i}-d{j}.example.com"))).collect(),
                ..Default::default()
            })
            .collect();

        let mut tasks = tokio::task::JoinSet::new();
        for bundle in bundles.clone() {
            let compiler = compiler.clone();
            tasks.spawn(async move { compiler.apply(&bundle).await });
        }
        while let Some(outcome) = tasks.join_next().await {
            let outcome = outcome.unwrap();
            assert!(outcome.ok, "{}", outcome.message);
            assert_eq!(outcome.domains, 50);
        }

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.matches("server:").count(), 1);
        assert_eq!(written.matches("local-zone:").count(), 50);
        let matching = bundles
            .iter()
            .filter(|b| without_timestamp(&render(&compile(b), Utc::now())) == without_timestamp(&written))
            .count();
        assert_eq!(matching, 1);
        assert!(!dir.path().join("blocklist.conf.tmp").exists());
    }
}
