//! nftables backend
//!
//! Drives the `nft` CLI. Rules live in `ip <nat_table> <nat_chain>`; a rule
//! handle is discovered by listing the chain with `-a` and matching on the
//! rule's content.

use super::{rule_expression, Firewall, RuleEntry};
use crate::config::Config;
use crate::mapping::Mapping;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

/// nftables CLI backend
pub struct NftFirewall {
    nat_table: String,
    nat_chain: String,
    filter_table: String,
    filter_chain: String,
    timeout: Duration,
    /// Program and leading arguments, e.g. `["nft"]` or `["sudo", "nft"]`
    command: Vec<String>,
    metrics: Arc<MetricsRegistry>,
}

impl NftFirewall {
    pub fn new(config: &Config, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            nat_table: config.nat_table.clone(),
            nat_chain: config.nat_chain.clone(),
            filter_table: config.filter_table.clone(),
            filter_chain: config.filter_chain.clone(),
            timeout: config.command_timeout(),
            command: vec!["nft".to_string()],
            metrics,
        }
    }

    /// Use a different invocation than plain `nft`
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `ip <table> <chain>` of the managed NAT chain
    fn managed_chain(&self) -> String {
        format!("ip {} {}", self.nat_table, self.nat_chain)
    }

    /// Run one nft command under the timeout, returning stdout
    async fn run(&self, args: &str) -> Result<String> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Config("empty nft command".to_string()))?;

        trace!("nft {}", args);
        let mut command = Command::new(program);
        command
            .args(leading)
            .args(args.split_whitespace())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(Error::FirewallTimeout {
                    command: args.to_string(),
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) => {
                return Err(Error::Firewall {
                    command: args.to_string(),
                    message: e.to_string(),
                });
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Firewall {
                command: args.to_string(),
                message: format!("{}: {}", output.status, detail),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Handles of the rules whose content matches `mapping`
    async fn matching_handles(&self, mapping: &Mapping) -> Result<Vec<u64>> {
        let handles: Vec<u64> = self
            .list_rules()
            .await?
            .iter()
            .filter(|rule| rule.matches(mapping))
            .map(|rule| rule.handle)
            .collect();
        if handles.is_empty() {
            return Err(Error::RuleNotFound {
                rule: rule_expression(mapping),
            });
        }
        Ok(handles)
    }

    async fn delete_handle(&self, handle: u64) -> Result<()> {
        let result = self
            .run(&format!("delete rule {} handle {}", self.managed_chain(), handle))
            .await
            .map(|_| ());
        self.metrics.record_firewall("delete", result.is_ok());
        result
    }
}

impl Firewall for NftFirewall {
    async fn ensure_tables_and_chains(&self) -> Result<()> {
        let commands = [
            format!("add table ip {}", self.nat_table),
            format!(
                "add chain ip {} {} {{ type nat hook prerouting priority dstnat; policy accept; }}",
                self.nat_table, self.nat_chain
            ),
            format!("add table ip {}", self.filter_table),
            format!(
                "add chain ip {} {} {{ type filter hook forward priority filter; policy accept; }}",
                self.filter_table, self.filter_chain
            ),
        ];

        for command in &commands {
            match self.run(command).await {
                Ok(_) => {}
                Err(Error::Firewall { message, .. }) if message.contains("exists") => {
                    debug!("Already present: nft {}", command);
                }
                Err(e) => {
                    self.metrics.record_firewall("ensure", false);
                    return Err(e);
                }
            }
        }

        self.metrics.record_firewall("ensure", true);
        info!(
            "nftables ready: nat chain {} {}, filter chain {} {}",
            self.nat_table, self.nat_chain, self.filter_table, self.filter_chain
        );
        Ok(())
    }

    async fn add_mapping(&self, mut mapping: Mapping) -> Result<Mapping> {
        let rule = rule_expression(&mapping);
        debug!("Adding nftables rule: {}", rule);

        let result = self
            .run(&format!("add rule {} {}", self.managed_chain(), rule))
            .await;
        self.metrics.record_firewall("add", result.is_ok());
        result?;

        // The rule just added is the newest match
        match self.matching_handles(&mapping).await {
            Ok(handles) => mapping.rule_handle = handles.into_iter().max().unwrap_or_default(),
            Err(e) => warn!(
                "Rule `{}` installed but its handle could not be found: {}",
                rule, e
            ),
        }
        Ok(mapping)
    }

    async fn remove_mapping(&self, mapping: &Mapping) -> Result<()> {
        let handle = if mapping.rule_handle != 0 {
            mapping.rule_handle
        } else {
            warn!(
                "No rule handle for {}, looking it up by content",
                mapping.key()
            );
            // A re-created tuple has a newer identical rule; ours is the oldest
            self.matching_handles(mapping)
                .await?
                .into_iter()
                .min()
                .unwrap_or_default()
        };
        self.delete_handle(handle).await
    }

    async fn list_rules(&self) -> Result<Vec<RuleEntry>> {
        let result = self
            .run(&format!("-a list chain {}", self.managed_chain()))
            .await;
        self.metrics.record_firewall("list", result.is_ok());
        Ok(parse_rules(&result?))
    }

    async fn cleanup_all(&self) -> Result<usize> {
        let rules = self.list_rules().await?;
        let mut removed = 0;
        for rule in &rules {
            match self.delete_handle(rule.handle).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete rule handle {}: {}", rule.handle, e),
            }
        }
        self.metrics
            .record_firewall("cleanup", removed == rules.len());
        Ok(removed)
    }
}

/// Extract rules from `nft -a list chain` output.
///
/// Rule lines end in `# handle N`; the chain header also carries a handle
/// but ends its expression with `{` and is skipped.
pub fn parse_rules(listing: &str) -> Vec<RuleEntry> {
    listing
        .lines()
        .filter_map(|line| {
            let (expression, handle) = line.rsplit_once("# handle ")?;
            let expression = expression.trim();
            if expression.is_empty() || expression.ends_with('{') {
                return None;
            }
            Some(RuleEntry {
                handle: handle.trim().parse().ok()?,
                expression: expression.to_string(),
            })
        })
        .collect()
}
