// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window sizing and truncation detection.

use tracing::warn;
use vidar_model::ChatMessage;

const MIN_WINDOW: u32 = 8_192;
const DEFAULT_WINDOW: u32 = 8_192;
const MIN_NUM_CTX: u32 = 4_096;
const NUM_CTX_ALIGN: u32 = 2_048;
/// Fixed headroom on top of payload + num_predict for template overhead.
const REQUEST_SLACK: u32 = 512;

pub struct ContextBudgeter {
    effective_window: u32,
    num_predict: u32,
    compaction_threshold: f32,
    /// Real prompt token count of the previous request, once known.
    last_prompt_actual: Option<u32>,
    warned_70: bool,
    warned_85: bool,
}

impl ContextBudgeter {
    /// `detected` comes from model capabilities, `per_model_cap` from user
    /// configuration.  The result is clamped to `[8192, min(per_model_cap,
    /// global_cap)]`.
    pub fn new(
        detected: Option<u32>,
        per_model_cap: Option<u32>,
        global_cap: u32,
        num_predict: u32,
        compaction_threshold: f32,
    ) -> Self {
        let upper = per_model_cap.unwrap_or(u32::MAX).min(global_cap).max(MIN_WINDOW);
        let effective_window = detected.unwrap_or(DEFAULT_WINDOW).clamp(MIN_WINDOW, upper);
        Self {
            effective_window,
            num_predict,
            compaction_threshold,
            last_prompt_actual: None,
            warned_70: false,
            warned_85: false,
        }
    }

    pub fn effective_window(&self) -> u32 {
        self.effective_window
    }

    /// chars/4 estimate over the request view of the history.
    pub fn estimate_payload_tokens(messages: &[ChatMessage]) -> u32 {
        messages.iter().map(|m| m.approx_tokens()).sum()
    }

    /// Size `num_ctx` for one request: payload + generation budget + slack,
    /// aligned up to 2048, clamped to `[4096, effective_window]`.
    pub fn num_ctx_for(&self, payload_tokens: u32) -> u32 {
        let need = payload_tokens
            .saturating_add(self.num_predict)
            .saturating_add(REQUEST_SLACK);
        let aligned = need.div_ceil(NUM_CTX_ALIGN) * NUM_CTX_ALIGN;
        aligned.clamp(MIN_NUM_CTX, self.effective_window)
    }

    /// Record the server-reported prompt token count for this request.
    ///
    /// Returns `true` when the server appears to be silently dropping
    /// messages (actual/estimated < 0.5 on a non-trivial prompt) — the
    /// caller must compact before the next iteration.
    pub fn record_prompt_eval(&mut self, actual: u32, estimated: u32) -> bool {
        self.last_prompt_actual = Some(actual);
        if estimated > 1_000 && (actual as f32) / (estimated as f32) < 0.5 {
            warn!(
                actual,
                estimated,
                "prompt token count far below estimate; server is silently truncating"
            );
            return true;
        }
        false
    }

    /// The token count driving the next compaction decision: the real
    /// prompt count when known, else the estimate.
    pub fn tokens_for_compaction(&self, estimated: u32) -> u32 {
        self.last_prompt_actual.unwrap_or(estimated)
    }

    /// Forget the recorded prompt count — it no longer describes the
    /// history after a compaction rewrote it.
    pub fn clear_prompt_actual(&mut self) {
        self.last_prompt_actual = None;
    }

    pub fn should_compact(&self, tokens: u32) -> bool {
        (tokens as f32) > self.compaction_threshold * (self.effective_window as f32)
    }

    /// One-time usage reminders at 70% and 85% of the window.
    pub fn usage_reminder(&mut self, tokens: u32) -> Option<String> {
        let pct = (tokens as f32) / (self.effective_window as f32) * 100.0;
        if pct >= 85.0 && !self.warned_85 {
            self.warned_85 = true;
            self.warned_70 = true;
            return Some(format!("Context usage: {pct:.0}% — be concise."));
        }
        if pct >= 70.0 && !self.warned_70 {
            self.warned_70 = true;
            return Some(format!("Context usage: {pct:.0}% — be concise."));
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
