//! Per-row store of captured responses.

use crate::model::{CapturedResponse, Header};
use std::collections::HashMap;

/// Responses captured so far in one chain, keyed by 1-indexed slot,
/// plus header values carried forward from earlier responses.
///
/// One store lives for exactly one row; it is never shared between rows.
#[derive(Debug, Default)]
pub struct ResponseStore {
    slots: HashMap<usize, CapturedResponse>,
    carried_headers: Vec<Header>,
}

impl ResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, slot: usize, response: CapturedResponse) {
        self.slots.insert(slot, response);
    }

    pub fn get(&self, slot: usize) -> Option<&CapturedResponse> {
        self.slots.get(&slot)
    }

    /// Carry `value` into header `name` for every later request of the
    /// chain. A later value for the same header replaces the earlier one.
    pub fn carry_header(&mut self, name: &str, value: String) {
        match self
            .carried_headers
            .iter_mut()
            .find(|h| h.key.eq_ignore_ascii_case(name))
        {
            Some(header) => header.value = value,
            None => self.carried_headers.push(Header::new(name, value)),
        }
    }

    pub fn carried_headers(&self) -> &[Header] {
        &self.carried_headers
    }
}
