//! Configuration validation

use super::Config;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_ports(config, &mut result);
    validate_limits(config, &mut result);
    validate_firewall(config, &mut result);
    validate_interfaces(config, &mut result);

    result
}

fn validate_ports(config: &Config, result: &mut ValidationResult) {
    if config.allowed_ports.is_empty() {
        result.error("allowed_ports: no ranges configured, every request would be refused");
    }

    for (i, range) in config.allowed_ports.iter().enumerate() {
        if range.start == 0 {
            result.error(format!("allowed_ports[{}]: port 0 is not a valid external port", i));
        }
        if range.start > range.end {
            result.error(format!(
                "allowed_ports[{}]: invalid range - start ({}) > end ({})",
                i, range.start, range.end
            ));
        } else if range.start < 1024 {
            result.warn(format!(
                "allowed_ports[{}]: range {}-{} admits privileged ports",
                i, range.start, range.end
            ));
        }
    }

    if config.listen_port == 0 {
        result.error("listen_port: must not be 0");
    }
}

fn validate_limits(config: &Config, result: &mut ValidationResult) {
    if config.max_mappings_per_ip == 0 {
        result.error("max_mappings_per_ip: must be at least 1");
    }
    if config.max_lifetime == 0 {
        result.error("max_lifetime: must be at least 1 second");
    }
    if config.default_lifetime == 0 {
        result.error("default_lifetime: must be at least 1 second");
    }
    if config.default_lifetime > config.max_lifetime {
        result.error(format!(
            "default_lifetime ({}) exceeds max_lifetime ({})",
            config.default_lifetime, config.max_lifetime
        ));
    }
    if config.cleanup_interval == 0 {
        result.error("cleanup_interval: must be at least 1 second");
    }
    if config.command_timeout == 0 {
        result.error("command_timeout: must be at least 1 second");
    }
    if config.cleanup_interval > u64::from(config.max_lifetime) {
        result.warn(format!(
            "cleanup_interval ({}s) is longer than max_lifetime ({}s), mappings will outlive their lifetime",
            config.cleanup_interval, config.max_lifetime
        ));
    }
}

fn validate_firewall(config: &Config, result: &mut ValidationResult) {
    let names = [
        ("nat_table", &config.nat_table),
        ("nat_chain", &config.nat_chain),
        ("filter_table", &config.filter_table),
        ("filter_chain", &config.filter_chain),
    ];
    for (field, value) in names {
        if value.is_empty() {
            result.error(format!("{}: must not be empty", field));
        } else if value.chars().any(|c| c.is_whitespace() || c == ';' || c == '{' || c == '}') {
            result.error(format!("{}: '{}' is not a valid nftables name", field, value));
        }
    }
    if config.dry_run {
        result.warn("dry_run: firewall changes are recorded in memory only");
    }
}

fn validate_interfaces(config: &Config, result: &mut ValidationResult) {
    if config.external_address.is_none() && config.external_interface.is_empty() {
        result.error("external_interface: required when external_address is not set");
    }
    if config.listen_address.is_none() && config.listen_interface.is_empty() {
        result.warn("listen_interface: empty, listening on all addresses");
    }
}
