//! Heuristic multi-dimensional reward scoring for conversation traces.
//!
//! Scores are a pure function of a trace's summary, metadata and span kinds.
//! Agent-mode sessions legitimately issue more tool calls and tokens, so most
//! step functions use wider thresholds for them.

use tracekeep_core::{ConversationTrace, Feedback, RewardDimension};

pub const USER_FEEDBACK: &str = "user_feedback";
pub const TASK_COMPLETION: &str = "task_completion";
pub const TOOL_SUCCESS_RATE: &str = "tool_success_rate";
pub const TOOL_CALL_RELIABILITY: &str = "tool_call_reliability";
pub const TOOL_CALL_EFFICIENCY: &str = "tool_call_efficiency";
pub const TOOL_DURATION_EFFICIENCY: &str = "tool_duration_efficiency";
pub const RESPONSE_EFFICIENCY: &str = "response_efficiency";
pub const TOKEN_EFFICIENCY: &str = "token_efficiency";
pub const CONVERSATION_EFFICIENCY: &str = "conversation_efficiency";

const DEFAULT_WEIGHT: f64 = 0.05;

/// Weight of a dimension in the composite reward.
pub fn weight_for(name: &str) -> f64 {
    match name {
        USER_FEEDBACK => 0.25,
        TASK_COMPLETION => 0.18,
        TOOL_SUCCESS_RATE => 0.12,
        TOOL_CALL_RELIABILITY => 0.08,
        TOOL_CALL_EFFICIENCY => 0.05,
        TOOL_DURATION_EFFICIENCY => 0.05,
        RESPONSE_EFFICIENCY => 0.08,
        TOKEN_EFFICIENCY => 0.08,
        CONVERSATION_EFFICIENCY => 0.11,
        _ => DEFAULT_WEIGHT,
    }
}

/// Computed dimensions and their weighted composite.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardScore {
    pub dimensions: Vec<RewardDimension>,
    pub final_reward: Option<f64>,
}

/// Scores a trace without modifying it.
pub fn score(trace: &ConversationTrace) -> RewardScore {
    let summary = &trace.summary;
    let agent = trace.is_agent_mode();
    let mut dimensions = Vec::new();

    let feedback_value = match summary.user_feedback {
        Some(Feedback::Good) => 1.0,
        Some(Feedback::Bad) => -1.0,
        None => 0.0,
    };
    dimensions.push(RewardDimension::new(USER_FEEDBACK, feedback_value));
    dimensions.push(RewardDimension::new(TASK_COMPLETION, task_completion(trace)));

    if summary.total_tool_calls > 0 {
        let total = summary.total_tool_calls;
        let success_ratio = summary.tool_calls_succeeded as f64 / total as f64;
        dimensions.push(RewardDimension::new(TOOL_SUCCESS_RATE, success_ratio * 2.0 - 1.0));
        dimensions.push(RewardDimension::new(
            TOOL_CALL_RELIABILITY,
            tool_call_reliability(summary.tool_calls_failed, agent),
        ));
        dimensions.push(RewardDimension::new(
            TOOL_CALL_EFFICIENCY,
            tool_call_efficiency(total, agent),
        ));
        if summary.total_tool_duration > 0 {
            let mean_ms = summary.total_tool_duration as f64 / total as f64;
            dimensions.push(RewardDimension::new(
                TOOL_DURATION_EFFICIENCY,
                tool_duration_efficiency(mean_ms),
            ));
        }
    }

    if summary.total_llm_calls > 0 {
        dimensions.push(RewardDimension::new(
            RESPONSE_EFFICIENCY,
            response_efficiency(summary.total_llm_calls, agent),
        ));
    }

    if summary.total_tokens > 0 {
        dimensions.push(RewardDimension::new(
            TOKEN_EFFICIENCY,
            token_efficiency(summary.total_tokens, agent),
        ));
    }

    let turns = trace.conversation_turns();
    if turns > 0 {
        dimensions.push(RewardDimension::new(
            CONVERSATION_EFFICIENCY,
            conversation_efficiency(turns, agent),
        ));
    }

    let final_reward = composite(&dimensions);
    RewardScore {
        dimensions,
        final_reward,
    }
}

/// Scores a trace and stores the result on its summary, replacing prior values.
pub fn apply_reward(trace: &mut ConversationTrace) -> Option<f64> {
    let RewardScore {
        dimensions,
        final_reward,
    } = score(trace);
    trace.summary.reward_dimensions = dimensions;
    trace.summary.final_reward = final_reward;
    final_reward
}

/// Weighted mean normalized by the weights actually present.
pub fn composite(dimensions: &[RewardDimension]) -> Option<f64> {
    let total_weight: f64 = dimensions.iter().map(|d| weight_for(&d.name)).sum();
    if dimensions.is_empty() || total_weight <= 0.0 {
        return None;
    }
    let weighted: f64 = dimensions
        .iter()
        .map(|d| d.value * weight_for(&d.name))
        .sum();
    Some((weighted / total_weight).clamp(-1.0, 1.0))
}

fn task_completion(trace: &ConversationTrace) -> f64 {
    let summary = &trace.summary;
    if summary.user_feedback == Some(Feedback::Good) {
        return 1.0;
    }
    if summary.has_errors {
        return -0.5;
    }
    if trace.is_ended() {
        return 0.8;
    }
    0.5
}

fn tool_call_reliability(failed: u64, agent: bool) -> f64 {
    let (severe, moderate, mild) = if agent { (5, 3, 2) } else { (3, 2, 1) };
    if failed >= severe {
        -1.0
    } else if failed >= moderate {
        -0.5
    } else if failed >= mild {
        -0.2
    } else {
        1.0
    }
}

fn tool_call_efficiency(total: u64, agent: bool) -> f64 {
    let (ideal, acceptable, heavy) = if agent { (8, 15, 25) } else { (3, 6, 10) };
    if total <= ideal {
        1.0
    } else if total <= acceptable {
        0.5
    } else if total <= heavy {
        0.0
    } else {
        -0.5
    }
}

fn tool_duration_efficiency(mean_ms: f64) -> f64 {
    if mean_ms > 10_000.0 {
        -0.5
    } else if mean_ms > 3_000.0 {
        0.0
    } else if mean_ms > 1_000.0 {
        0.5
    } else {
        1.0
    }
}

fn response_efficiency(llm_calls: u64, agent: bool) -> f64 {
    let threshold = if agent { 3 } else { 1 };
    let excess = llm_calls.saturating_sub(threshold) as f64;
    (1.0 - excess * 0.4).max(-1.0)
}

fn token_efficiency(tokens: u64, agent: bool) -> f64 {
    let (lean, moderate, heavy) = if agent {
        (5_000, 15_000, 30_000)
    } else {
        (2_000, 5_000, 10_000)
    };
    if tokens <= lean {
        1.0
    } else if tokens <= moderate {
        0.5
    } else if tokens <= heavy {
        0.0
    } else {
        -0.5
    }
}

fn conversation_efficiency(turns: usize, agent: bool) -> f64 {
    let threshold = if agent { 3 } else { 2 };
    if turns <= threshold {
        1.0
    } else if turns <= threshold * 2 {
        0.3
    } else if turns <= threshold * 3 {
        -0.3
    } else {
        -0.8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracekeep_core::{ChatMode, Metadata, Span, SpanData};

    fn dimension(score: &RewardScore, name: &str) -> Option<f64> {
        score
            .dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value)
    }

    fn tool_span(trace: &ConversationTrace, success: bool, duration: u64) -> Span {
        let data = SpanData::ToolCall {
            tool_name: "search".into(),
            tool_params: None,
            tool_result: None,
            tool_success: Some(success),
            tool_error: None,
        };
        Span::new(trace, 0, data, 0, Some(duration))
    }

    #[test]
    fn test_empty_trace_has_baseline_dimensions() {
        let trace = ConversationTrace::new("t", "thread", Metadata::new(), 0);
        let score = score(&trace);

        assert_eq!(score.dimensions.len(), 2);
        assert_eq!(dimension(&score, USER_FEEDBACK), Some(0.0));
        assert_eq!(dimension(&score, TASK_COMPLETION), Some(0.5));
        // (0.25 * 0 + 0.18 * 0.5) / 0.43
        let expected = 0.09 / 0.43;
        assert!((score.final_reward.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_task_completion_precedence() {
        let mut trace = ConversationTrace::new("t", "thread", Metadata::new(), 0);
        trace.end_time = Some(10);
        assert_eq!(task_completion(&trace), 0.8);

        trace.summary.has_errors = true;
        assert_eq!(task_completion(&trace), -0.5);

        trace.summary.user_feedback = Some(Feedback::Good);
        assert_eq!(task_completion(&trace), 1.0);
    }

    #[test]
    fn test_reliability_thresholds_by_mode() {
        assert_eq!(tool_call_reliability(0, false), 1.0);
        assert_eq!(tool_call_reliability(1, false), -0.2);
        assert_eq!(tool_call_reliability(2, false), -0.5);
        assert_eq!(tool_call_reliability(3, false), -1.0);

        assert_eq!(tool_call_reliability(1, true), 1.0);
        assert_eq!(tool_call_reliability(2, true), -0.2);
        assert_eq!(tool_call_reliability(3, true), -0.5);
        assert_eq!(tool_call_reliability(5, true), -1.0);
    }

    #[test]
    fn test_efficiency_step_functions() {
        assert_eq!(tool_call_efficiency(3, false), 1.0);
        assert_eq!(tool_call_efficiency(4, false), 0.5);
        assert_eq!(tool_call_efficiency(10, false), 0.0);
        assert_eq!(tool_call_efficiency(11, false), -0.5);
        assert_eq!(tool_call_efficiency(8, true), 1.0);
        assert_eq!(tool_call_efficiency(26, true), -0.5);

        assert_eq!(tool_duration_efficiency(500.0), 1.0);
        assert_eq!(tool_duration_efficiency(2_000.0), 0.5);
        assert_eq!(tool_duration_efficiency(5_000.0), 0.0);
        assert_eq!(tool_duration_efficiency(12_000.0), -0.5);

        assert_eq!(response_efficiency(1, false), 1.0);
        assert!((response_efficiency(2, false) - 0.6).abs() < 1e-9);
        assert_eq!(response_efficiency(3, true), 1.0);
        assert_eq!(response_efficiency(20, false), -1.0);

        assert_eq!(token_efficiency(15, false), 1.0);
        assert_eq!(token_efficiency(4_000, false), 0.5);
        assert_eq!(token_efficiency(4_000, true), 1.0);
        assert_eq!(token_efficiency(40_000, true), -0.5);

        assert_eq!(conversation_efficiency(2, false), 1.0);
        assert_eq!(conversation_efficiency(4, false), 0.3);
        assert_eq!(conversation_efficiency(6, false), -0.3);
        assert_eq!(conversation_efficiency(7, false), -0.8);
        assert_eq!(conversation_efficiency(3, true), 1.0);
    }

    #[test]
    fn test_failed_tool_calls_score_reliability_minus_one() {
        let mut trace = ConversationTrace::new("t", "thread", Metadata::new(), 0);
        for _ in 0..5 {
            let span = tool_span(&trace, false, 100);
            trace.append(span, 200);
        }
        trace.end_time = Some(1);

        let score = score(&trace);
        assert_eq!(dimension(&score, TOOL_CALL_RELIABILITY), Some(-1.0));
        assert_eq!(dimension(&score, TOOL_SUCCESS_RATE), Some(-1.0));
        assert_eq!(dimension(&score, TOOL_CALL_EFFICIENCY), Some(0.5));
        assert_eq!(dimension(&score, TOOL_DURATION_EFFICIENCY), Some(1.0));
    }

    #[test]
    fn test_agent_mode_relaxes_thresholds() {
        let mut normal = ConversationTrace::new("n", "thread", Metadata::new(), 0);
        let mut agent = ConversationTrace::new("a", "thread", ChatMode::Agent.metadata(), 0);
        for trace in [&mut normal, &mut agent] {
            for _ in 0..6 {
                let span = tool_span(trace, true, 0);
                trace.append(span, 200);
            }
        }

        assert_eq!(dimension(&score(&normal), TOOL_CALL_EFFICIENCY), Some(0.5));
        assert_eq!(dimension(&score(&agent), TOOL_CALL_EFFICIENCY), Some(1.0));
        assert_eq!(dimension(&score(&normal), TOOL_DURATION_EFFICIENCY), None);
    }

    #[test]
    fn test_scoring_is_deterministic_and_bounded() {
        let mut trace = ConversationTrace::new("t", "thread", Metadata::new(), 0);
        for i in 0..12 {
            let span = tool_span(&trace, i % 3 != 0, 15_000);
            trace.append(span, 200);
        }
        trace.summary.total_llm_calls = 9;
        trace.summary.total_tokens = 50_000;
        trace.summary.has_errors = true;
        trace.summary.user_feedback = Some(Feedback::Bad);

        let first = apply_reward(&mut trace);
        let dims = trace.summary.reward_dimensions.clone();
        let second = apply_reward(&mut trace);

        assert_eq!(first, second);
        assert_eq!(dims, trace.summary.reward_dimensions);
        for d in &dims {
            assert!((-1.0..=1.0).contains(&d.value), "{} out of range", d.name);
        }
        let reward = first.unwrap();
        assert!((-1.0..=1.0).contains(&reward));
        assert!(reward < 0.0);
    }

    #[test]
    fn test_composite_uses_default_weight_for_unknown_dimensions() {
        let dims = vec![
            RewardDimension::new(USER_FEEDBACK, 1.0),
            RewardDimension::new("custom", -1.0),
        ];
        let expected = (0.25 - 0.05) / 0.30;
        assert!((composite(&dims).unwrap() - expected).abs() < 1e-9);
        assert_eq!(composite(&[]), None);
    }
}
