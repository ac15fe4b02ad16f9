//! Context window management.
//!
//! Two mutually exclusive strategies, chosen once per session from the
//! group-attention factor:
//!
//! - **Shift** (`grp_attn_n == 1`): when the next batch would not fit, evict
//!   the older half of everything after the first `n_keep` tokens and slide
//!   the rest back. The anchored prefix (system prompt, tool preamble) is
//!   never evicted.
//! - **Self-extend** (`grp_attn_n > 1`): once the position counter passes the
//!   current group window, remap cache positions so the window is compressed
//!   by the group factor. Every division is integer (floor) division.

use hearth_config::SessionConfig;
use hearth_core::{ContextError, InferenceBackend};
use tracing::debug;

/// What a call to [`ContextWindow::make_room`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    Unchanged,
    Shifted { discarded: i32 },
    Extended { steps: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextWindow {
    Shift {
        n_keep: i32,
        enabled: bool,
        /// `n_predict == -2`: stop instead of shifting
        stop_at_full: bool,
    },
    SelfExtend {
        ga_n: i32,
        ga_w: i32,
        ga_i: i32,
    },
}

impl ContextWindow {
    /// Pick the strategy and check the model-dependent self-extend invariants.
    pub fn for_session(
        config: &SessionConfig,
        n_keep: i32,
        n_ctx: u32,
        n_ctx_train: u32,
    ) -> Result<Self, ContextError> {
        if config.grp_attn_n == 1 {
            return Ok(ContextWindow::Shift {
                n_keep,
                enabled: config.ctx_shift,
                stop_at_full: config.n_predict == -2,
            });
        }

        let (ga_n, ga_w) = (config.grp_attn_n, config.grp_attn_w);
        if ga_n < 1 || ga_w <= 0 || ga_w % ga_n != 0 {
            return Err(ContextError::InvalidWindow(format!(
                "grp_attn_w ({ga_w}) must be a positive multiple of grp_attn_n ({ga_n})"
            )));
        }
        config
            .validate_for_model(n_ctx, n_ctx_train)
            .map_err(|e| ContextError::InvalidWindow(e.to_string()))?;

        Ok(ContextWindow::SelfExtend { ga_n, ga_w, ga_i: 0 })
    }

    pub fn n_keep(&self) -> Option<i32> {
        match self {
            ContextWindow::Shift { n_keep, .. } => Some(*n_keep),
            ContextWindow::SelfExtend { .. } => None,
        }
    }

    /// Make room for `pending` tokens at position `*n_past`, editing the
    /// backend's cache and the position counter in place.
    pub fn make_room<B: InferenceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        n_past: &mut i32,
        pending: usize,
        n_ctx: u32,
    ) -> Result<WindowAction, ContextError> {
        match self {
            ContextWindow::Shift {
                n_keep,
                enabled,
                stop_at_full,
            } => {
                // positions that must be freed for the batch to fit
                let overflow = i64::from(*n_past) + (pending as i64) - i64::from(n_ctx) + 1;
                if overflow <= 0 {
                    return Ok(WindowAction::Unchanged);
                }
                if !*enabled || *stop_at_full {
                    return Err(ContextError::Exhausted { n_ctx });
                }

                let n_left = *n_past - *n_keep;
                let n_discard = i64::from(n_left / 2).max(overflow);
                if n_left <= 0 || n_discard > i64::from(n_left) {
                    return Err(ContextError::Exhausted { n_ctx });
                }
                let n_discard = n_discard as i32;

                debug!(
                    n_past = *n_past,
                    n_left,
                    n_ctx,
                    n_keep = *n_keep,
                    n_discard,
                    "context full, swapping"
                );

                backend.kv_remove(*n_keep, Some(*n_keep + n_discard));
                backend.kv_shift(*n_keep + n_discard, Some(*n_past), -n_discard);
                *n_past -= n_discard;

                Ok(WindowAction::Shifted {
                    discarded: n_discard,
                })
            }
            ContextWindow::SelfExtend { ga_n, ga_w, ga_i } => {
                let (ga_n, ga_w) = (*ga_n, *ga_w);
                let mut steps = 0;
                while *n_past >= *ga_i + ga_w {
                    let ib = (ga_n * *ga_i) / ga_w;
                    let bd = (ga_w / ga_n) * (ga_n - 1);
                    let dd = (ga_w / ga_n) - ib * bd - ga_w;

                    debug!(
                        ga_i = *ga_i,
                        n_past = *n_past,
                        ib,
                        bd,
                        dd,
                        "self-extend step"
                    );

                    backend.kv_shift(*ga_i, Some(*n_past), ib * bd);
                    backend.kv_divide(*ga_i + ib * bd, Some(*ga_i + ib * bd + ga_w), ga_n);
                    backend.kv_shift(*ga_i + ib * bd + ga_w, Some(*n_past + ib * bd), dd);

                    *n_past -= bd;
                    *ga_i += ga_w / ga_n;
                    steps += 1;
                }
                Ok(if steps == 0 {
                    WindowAction::Unchanged
                } else {
                    WindowAction::Extended { steps }
                })
            }
        }
    }

    /// Current group window start, for self-extend.
    pub fn ga_i(&self) -> Option<i32> {
        match self {
            ContextWindow::SelfExtend { ga_i, .. } => Some(*ga_i),
            ContextWindow::Shift { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn session(ga_n: i32, ga_w: i32) -> SessionConfig {
        SessionConfig {
            grp_attn_n: ga_n,
            grp_attn_w: ga_w,
            ..SessionConfig::default()
        }
    }

    fn fill(backend: &mut ScriptedBackend, n: i32) {
        let tokens: Vec<i32> = (0..n).map(|i| 1000 + i).collect();
        backend.decode(&tokens, 0).unwrap();
    }

    #[test]
    fn shift_is_a_noop_while_batch_fits() {
        let mut backend = ScriptedBackend::new(32);
        fill(&mut backend, 10);
        let mut window = ContextWindow::for_session(&session(1, 512), 4, 32, 32).unwrap();
        let mut n_past = 10;
        let action = window.make_room(&mut backend, &mut n_past, 5, 32).unwrap();
        assert_eq!(action, WindowAction::Unchanged);
        assert_eq!(n_past, 10);
    }

    #[test]
    fn shift_discards_half_after_keep() {
        let mut backend = ScriptedBackend::new(32);
        fill(&mut backend, 31);
        let mut window = ContextWindow::for_session(&session(1, 512), 4, 32, 32).unwrap();
        let mut n_past = 31;

        let action = window.make_room(&mut backend, &mut n_past, 1, 32).unwrap();
        assert_eq!(action, WindowAction::Shifted { discarded: 13 });
        assert_eq!(n_past, 18);

        let cells = backend.probe().kv_cells();
        assert_eq!(cells.len(), 18);
        for (i, (token, pos)) in cells.iter().enumerate() {
            assert_eq!(*pos, i as i32);
            if i < 4 {
                assert_eq!(*token, 1000 + i as i32, "kept prefix must be untouched");
            } else {
                assert_eq!(*token, 1000 + 13 + i as i32);
            }
        }
    }

    #[test]
    fn disabled_shift_is_fatal() {
        let mut backend = ScriptedBackend::new(16);
        let config = SessionConfig {
            ctx_shift: false,
            ..SessionConfig::default()
        };
        let mut window = ContextWindow::for_session(&config, 0, 16, 16).unwrap();
        let mut n_past = 15;
        let err = window.make_room(&mut backend, &mut n_past, 1, 16).unwrap_err();
        assert!(matches!(err, ContextError::Exhausted { n_ctx: 16 }));
    }

    #[test]
    fn stop_at_full_budget_is_fatal() {
        let mut backend = ScriptedBackend::new(16);
        let config = SessionConfig {
            n_predict: -2,
            ..SessionConfig::default()
        };
        let mut window = ContextWindow::for_session(&config, 0, 16, 16).unwrap();
        let mut n_past = 16;
        assert!(window.make_room(&mut backend, &mut n_past, 0, 16).is_err());
    }

    #[test]
    fn shift_with_everything_kept_cannot_make_room() {
        let mut backend = ScriptedBackend::new(16);
        let mut window = ContextWindow::for_session(&session(1, 512), 15, 16, 16).unwrap();
        let mut n_past = 15;
        assert!(window.make_room(&mut backend, &mut n_past, 1, 16).is_err());
    }

    #[test]
    fn shift_discards_enough_for_a_large_batch() {
        let mut backend = ScriptedBackend::new(32);
        fill(&mut backend, 20);
        let mut window = ContextWindow::for_session(&session(1, 512), 4, 32, 32).unwrap();
        let mut n_past = 20;

        // half of the 16 evictable tokens is not enough for 20 more
        let action = window.make_room(&mut backend, &mut n_past, 20, 32).unwrap();
        assert_eq!(action, WindowAction::Shifted { discarded: 9 });
        assert_eq!(n_past, 11);
        assert!(n_past + 20 < 32);

        let cells = backend.probe().kv_cells();
        assert_eq!(cells.len(), 11);
        assert_eq!(cells[3], (1003, 3));
        assert_eq!(cells[4], (1013, 4));
    }

    #[test]
    fn shift_fails_when_batch_cannot_fit_after_keep() {
        let mut backend = ScriptedBackend::new(32);
        fill(&mut backend, 10);
        let mut window = ContextWindow::for_session(&session(1, 512), 4, 32, 32).unwrap();
        let mut n_past = 10;
        let err = window.make_room(&mut backend, &mut n_past, 29, 32).unwrap_err();
        assert!(matches!(err, ContextError::Exhausted { n_ctx: 32 }));
        assert_eq!(n_past, 10);
    }

    #[test]
    fn self_extend_rejects_bad_geometry() {
        assert!(ContextWindow::for_session(&session(4, 510), 0, 8192, 2048).is_err());
        assert!(ContextWindow::for_session(&session(4, 512), 0, 4096, 2048).is_err());
        assert!(ContextWindow::for_session(&session(4, 512), 0, 8192, 2000).is_err());
        assert!(ContextWindow::for_session(&session(4, 512), 0, 8192, 2048).is_ok());
    }

    #[test]
    fn self_extend_first_step_matches_reference_arithmetic() {
        let mut backend = ScriptedBackend::new(64);
        fill(&mut backend, 8);
        let mut window = ContextWindow::for_session(&session(2, 8), 0, 64, 16).unwrap();
        let mut n_past = 8;

        let action = window.make_room(&mut backend, &mut n_past, 1, 64).unwrap();
        assert_eq!(action, WindowAction::Extended { steps: 1 });
        // bd = (8/2)*(2-1) = 4
        assert_eq!(n_past, 4);
        assert_eq!(window.ga_i(), Some(4));
        let positions: Vec<i32> = backend.probe().kv_cells().iter().map(|c| c.1).collect();
        assert_eq!(positions, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn self_extend_positions_stay_in_range() {
        for (ga_n, ga_w, n_ctx_train) in [(2, 8, 16), (4, 16, 32), (2, 32, 64)] {
            let n_ctx = (n_ctx_train * ga_n) as u32 * 4;
            let mut backend = ScriptedBackend::new(n_ctx);
            let mut window =
                ContextWindow::for_session(&session(ga_n, ga_w), 0, n_ctx, n_ctx_train as u32)
                    .unwrap();
            let mut n_past = 0;
            for step in 0..(n_ctx as i32 - 8) {
                window.make_room(&mut backend, &mut n_past, 1, n_ctx).unwrap();
                for (_, pos) in backend.probe().kv_cells() {
                    assert!(pos >= 0, "negative position at step {step}");
                    assert!(pos < n_past.max(1), "position {pos} beyond n_past {n_past}");
                }
                backend.decode(&[1000 + step], n_past).unwrap();
                n_past += 1;
            }
        }
    }
}
