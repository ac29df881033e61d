use agent_cadence::backend::PatternClassifier;
use agent_cadence::models::AgentState;
use agent_cadence::{AppError, GlobalConfig};

fn classifier() -> PatternClassifier {
    GlobalConfig::default()
        .classifier()
        .expect("default patterns compile")
}

#[test]
fn empty_sample_is_unknown() {
    let state = classifier().classify("\n   \n");
    assert_eq!(state.status, AgentState::Unknown);
    assert_eq!(state.classification(), AgentState::Unknown);
}

#[test]
fn prompt_on_last_line_is_idle() {
    let state = classifier().classify("Done. All tests pass.\n\n> \n");
    assert_eq!(state.status, AgentState::Idle);
    assert!(state.classification().is_ready());
}

#[test]
fn busy_marker_beats_idle_prompt() {
    let sample = "✻ Thinking… (esc to interrupt)\n> \n";
    let state = classifier().classify(sample);
    assert_eq!(state.status, AgentState::Busy);
    assert!(!state.classification().is_ready());
}

#[test]
fn waiting_question_near_bottom_is_waiting_input() {
    let sample = "Edit src/lib.rs\nDo you want to make this edit? (y/n)\n";
    let state = classifier().classify(sample);
    assert!(state.is_waiting);
    assert_eq!(state.classification(), AgentState::WaitingInput);
    assert!(state.classification().is_ready());
}

#[test]
fn old_question_scrolled_out_of_window_is_ignored() {
    let mut sample = String::from("Do you want to continue? (y/n)\n");
    for i in 0..10 {
        sample.push_str(&format!("output line {i}\n"));
    }
    sample.push_str("> \n");

    let state = classifier().classify(&sample);
    assert!(!state.is_waiting);
    assert_eq!(state.classification(), AgentState::Idle);
}

#[test]
fn error_output_classifies_as_error() {
    let sample = "Error: rate limit exceeded, retry later\n> \n";
    let state = classifier().classify(sample);
    assert!(state.has_error);
    assert_eq!(state.status, AgentState::Idle);
    assert_eq!(state.classification(), AgentState::Error);
}

#[test]
fn waiting_takes_precedence_over_error() {
    let sample = "error: build failed\nPress Enter to retry\n";
    let state = classifier().classify(sample);
    assert!(state.has_error && state.is_waiting);
    assert_eq!(state.classification(), AgentState::WaitingInput);
}

#[test]
fn unmatched_output_is_unknown() {
    let state = classifier().classify("compiling agent-cadence v0.1.0\n");
    assert_eq!(state.classification(), AgentState::Unknown);
}

#[test]
fn invalid_pattern_is_config_error() {
    let err = PatternClassifier::new(&["(unclosed".to_owned()], &[], &[], &[]).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
