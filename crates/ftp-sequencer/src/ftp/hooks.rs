//! Per-verb payload transforms applied before a transfer result reaches the caller.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::types::TransferOutput;
use chrono::{NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

lazy_static! {
    static ref MDTM_STAMP: Regex = Regex::new(r"(\d{14})").unwrap();
    static ref FIRST_INTEGER: Regex = Regex::new(r"(\d+)").unwrap();
}

pub type PayloadHook = Arc<dyn Fn(&[u8]) -> FtpResult<TransferOutput> + Send + Sync>;

/// Verb → transform. Built once per client, then shared read-only.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, PayloadHook>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut verbs: Vec<_> = self.hooks.keys().collect();
        verbs.sort();
        f.debug_struct("HookRegistry").field("verbs", &verbs).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the LIST, MDTM, NLST and SIZE transforms.
    pub fn standard() -> Self {
        let mut reg = Self::new();
        let builtin: [(&str, PayloadHook); 4] = [
            ("LIST", Arc::new(list_hook) as PayloadHook),
            ("MDTM", Arc::new(mdtm_hook) as PayloadHook),
            ("NLST", Arc::new(nlst_hook) as PayloadHook),
            ("SIZE", Arc::new(size_hook) as PayloadHook),
        ];
        for (verb, hook) in builtin {
            reg.hooks.insert(verb.to_string(), hook);
        }
        reg
    }

    /// Add a transform. A verb may only be registered once.
    pub fn register<F>(&mut self, verb: &str, hook: F) -> FtpResult<()>
    where
        F: Fn(&[u8]) -> FtpResult<TransferOutput> + Send + Sync + 'static,
    {
        let verb = verb.to_ascii_uppercase();
        if self.hooks.contains_key(&verb) {
            return Err(FtpError::invalid_config(format!(
                "a payload hook for {} is already registered",
                verb
            )));
        }
        self.hooks.insert(verb, Arc::new(hook));
        Ok(())
    }

    pub fn get(&self, verb: &str) -> Option<PayloadHook> {
        self.hooks.get(&verb.to_ascii_uppercase()).cloned()
    }

    /// Run the verb's transform, or pass the bytes through untouched.
    pub fn apply(&self, verb: &str, payload: &[u8]) -> FtpResult<TransferOutput> {
        match self.get(verb) {
            Some(hook) => hook(payload),
            None => Ok(TransferOutput::Raw(payload.to_vec())),
        }
    }
}

fn list_hook(payload: &[u8]) -> FtpResult<TransferOutput> {
    let text = String::from_utf8_lossy(payload);
    Ok(TransferOutput::Listing(parser::parse_listing(&text)))
}

fn nlst_hook(payload: &[u8]) -> FtpResult<TransferOutput> {
    let text = String::from_utf8_lossy(payload);
    let names = text
        .lines()
        .map(str::trim_end)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .collect();
    Ok(TransferOutput::Names(names))
}

fn mdtm_hook(payload: &[u8]) -> FtpResult<TransferOutput> {
    let text = String::from_utf8_lossy(payload);
    let stamp = MDTM_STAMP
        .captures(&text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| FtpError::protocol_error(format!("no MDTM timestamp in '{}'", text.trim())))?;
    let dt = NaiveDateTime::parse_from_str(stamp.as_str(), "%Y%m%d%H%M%S")
        .map_err(|e| FtpError::protocol_error(format!("bad MDTM timestamp {}: {}", stamp.as_str(), e)))?;
    Ok(TransferOutput::Timestamp(Utc.from_utc_datetime(&dt).timestamp_millis()))
}

fn size_hook(payload: &[u8]) -> FtpResult<TransferOutput> {
    let text = String::from_utf8_lossy(payload);
    FIRST_INTEGER
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(TransferOutput::Size)
        .ok_or_else(|| FtpError::protocol_error(format!("no SIZE in '{}'", text.trim())))
}
