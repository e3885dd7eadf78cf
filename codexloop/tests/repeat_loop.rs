//! Repeat loop cancellation through the on-disk state file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use codexloop::core::bound::IterationBound;
use codexloop::io::loop_state::{cancel_repeat_loop, read_state_fields, state_path};
use codexloop::repeat::{FixedPrompt, RepeatConfig, RepeatEvent, RepeatLoop, StopReason};
use codexloop::test_support::ScriptedFactory;

/// Agent that deletes the state file while answering call number `cancel_on`.
fn canceling_agent(state: PathBuf, cancel_on: u32) -> (ScriptedFactory, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let factory = ScriptedFactory::responding(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == cancel_on {
            fs::remove_file(&state).expect("remove state");
        }
        Ok(format!("reply {n}"))
    });
    (factory, calls)
}

fn unbounded(workdir: &Path) -> RepeatConfig {
    RepeatConfig {
        completion_promise: Some("DONE".to_string()),
        ..RepeatConfig::new(workdir)
    }
}

#[test]
fn removing_state_mid_iteration_cancels_after_it() {
    for cancel_on in [1, 4] {
        let temp = tempfile::tempdir().expect("tempdir");
        let (factory, calls) = canceling_agent(state_path(temp.path()), cancel_on);

        let mut stopped = None;
        let plan = FixedPrompt::new("keep going");
        let repeat = RepeatLoop::new(plan, &factory, unbounded(temp.path())).expect("loop");
        let outcome = repeat
            .run(|event| {
                if let RepeatEvent::Stopped(reason, message) = event {
                    stopped = Some((reason, message.to_string()));
                }
            })
            .expect("run");

        assert_eq!(outcome.stop, StopReason::Canceled);
        assert_eq!(outcome.iterations, cancel_on);
        assert_eq!(outcome.last_reply, Some(format!("reply {cancel_on}")));
        assert_eq!(calls.load(Ordering::SeqCst), cancel_on);
        assert_eq!(
            stopped,
            Some((StopReason::Canceled, "Loop canceled: state file removed.".to_string()))
        );
        assert!(!state_path(temp.path()).exists());
    }
}

#[test]
fn state_file_tracks_the_current_iteration() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = state_path(temp.path());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let state = path.clone();
    let factory = ScriptedFactory::responding(move |_| {
        let fields = read_state_fields(&state).expect("state fields");
        let iteration = fields
            .iter()
            .find(|(key, _)| key == "iteration")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        record.lock().expect("lock").push(iteration);
        Ok("still working".to_string())
    });
    let config = RepeatConfig {
        max_iterations: IterationBound::new(3),
        ..RepeatConfig::new(temp.path())
    };

    let outcome = RepeatLoop::new(FixedPrompt::new("keep going"), &factory, config)
        .expect("loop")
        .run(|_| {})
        .expect("run");

    assert_eq!(outcome.stop, StopReason::MaxIterations);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(*seen.lock().expect("lock"), ["1", "2", "3"]);
    assert!(!path.exists());
}

#[test]
fn cancel_reports_iteration_of_live_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path().to_path_buf();
    let messages = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = Arc::clone(&messages);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let factory = ScriptedFactory::responding(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
            let message = cancel_repeat_loop(&workdir).expect("cancel");
            record.lock().expect("lock").push(message);
        }
        Ok("working".to_string())
    });

    let outcome = RepeatLoop::new(FixedPrompt::new("go"), &factory, unbounded(temp.path()))
        .expect("loop")
        .run(|_| {})
        .expect("run");

    assert_eq!(outcome.stop, StopReason::Canceled);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(*messages.lock().expect("lock"), ["Canceled loop at iteration 2."]);
    assert_eq!(
        cancel_repeat_loop(temp.path()).expect("cancel"),
        "No active loop state found."
    );
}
