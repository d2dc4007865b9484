// Copyright © 2024 Pathway

use std::sync::{Arc, Mutex};
use std::thread;

use assert_matches::assert_matches;

use splicer_engine::engine::{Error, Record, SplicerEvent, SplicerState};
use splicer_engine::splicer::{Splicer, SplicerHandle};
use splicer_engine::strands::{Strand, StrandId};
use splicer_engine::weaving::{Progress, Weaver, WeaverKind};

use super::helpers::{quick_config, recording_analysis, wait_until, WAIT};

type Transitions = Arc<Mutex<Vec<(SplicerState, SplicerState)>>>;

fn record_transitions(handle: &SplicerHandle<i64>) -> Transitions {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    handle.add_listener(move |event| {
        if let SplicerEvent::StateChanged { old, new } = event {
            sink.lock().unwrap().push((*old, *new));
        }
    });
    transitions
}

#[test]
fn test_producers_are_spliced_in_order() -> eyre::Result<()> {
    for kind in [
        WeaverKind::TwoPass,
        WeaverKind::Tree,
        WeaverKind::TreeWithTimeout {
            max_idle_ticks: 1000,
        },
    ] {
        let (delivered, analysis) = recording_analysis();
        let splicer = Splicer::new(quick_config(), kind, analysis);
        let tails = (0..4)
            .map(|_| splicer.begin_strand())
            .collect::<Result<Vec<_>, _>>()?;
        splicer.start()?;

        thread::scope(|scope| -> eyre::Result<()> {
            let producers: Vec<_> = tails
                .iter()
                .zip(0i64..)
                .map(|(tail, offset)| {
                    scope.spawn(move || -> eyre::Result<()> {
                        let records: Vec<i64> = (0..50).map(|i| i * 4 + offset).collect();
                        for chunk in records.chunks(7) {
                            tail.push_all(chunk.iter().copied())?;
                        }
                        tail.push(i64::last())?;
                        Ok(())
                    })
                })
                .collect();
            for producer in producers {
                producer.join().unwrap()?;
            }
            Ok(())
        })?;

        assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT), "{kind:?}");
        splicer.analyze()?;
        let expected: Vec<i64> = (0..200).collect();
        assert_eq!(*delivered.lock().unwrap(), expected, "{kind:?}");

        let stats = splicer.stats();
        assert_eq!(stats.woven, 200);
        assert_eq!(stats.defects, 0);
        assert_eq!(stats.rope.len, 200);
    }
    Ok(())
}

#[test]
fn test_lifecycle_events_follow_the_run() -> eyre::Result<()> {
    let (_delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let transitions = record_transitions(&splicer);
    let tail = splicer.begin_strand()?;
    tail.push_all([1, 2, i64::last()])?;

    splicer.start()?;
    let expected = vec![
        (SplicerState::Stopped, SplicerState::Starting),
        (SplicerState::Starting, SplicerState::Started),
        (SplicerState::Started, SplicerState::Stopping),
        (SplicerState::Stopping, SplicerState::Stopped),
    ];
    assert!(wait_until(|| transitions.lock().unwrap().len() == 4));
    assert_eq!(*transitions.lock().unwrap(), expected);

    splicer.dispose()?;
    assert_eq!(
        transitions.lock().unwrap().last(),
        Some(&(SplicerState::Stopped, SplicerState::Disposed))
    );
    assert_matches!(
        splicer.begin_strand(),
        Err(Error::RegistrationClosed(SplicerState::Disposed))
    );
    Ok(())
}

#[test]
fn test_strands_can_only_join_a_stopped_splicer() -> eyre::Result<()> {
    let (_delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::Tree, analysis);
    let _tail = splicer.begin_strand()?;
    splicer.start()?;
    assert_matches!(splicer.begin_strand(), Err(Error::RegistrationClosed(_)));
    assert_matches!(splicer.start(), Err(Error::IllegalTransition { .. }));
    assert_matches!(splicer.start_at(i64::last()), Err(Error::SentinelCutoff));
    Ok(())
}

#[test]
fn test_clean_start_skips_early_records() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;
    first.push_all([1, 3, 7, 9, 11, i64::last()])?;
    second.push_all([4, 8, 9, 12, i64::last()])?;

    splicer.start_at(6)?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), vec![7, 8, 9, 9, 11, 12]);

    assert_matches!(splicer.stop_at(5), Err(Error::CutoffPassed { .. }));
    Ok(())
}

#[test]
fn test_clean_start_from_the_natural_lower_bound() -> eyre::Result<()> {
    for kind in [WeaverKind::TwoPass, WeaverKind::Tree] {
        let (delivered, analysis) = recording_analysis();
        let splicer = Splicer::new(quick_config(), kind, analysis);
        let first = splicer.begin_strand()?;
        let second = splicer.begin_strand()?;
        first.push_all([1, 2, 3, 5, 9, 9, i64::last()])?;
        second.push_all([4, 5, 7, 8, 11, 12, i64::last()])?;

        splicer.start_at(6)?;
        assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT), "{kind:?}");
        splicer.analyze()?;
        assert_eq!(*delivered.lock().unwrap(), vec![7, 8, 9, 9, 11, 12], "{kind:?}");
    }
    Ok(())
}

#[test]
fn test_stop_before_weaving_keeps_the_clean_start() -> eyre::Result<()> {
    for kind in [WeaverKind::TwoPass, WeaverKind::Tree] {
        let (delivered, analysis) = recording_analysis();
        let splicer = Splicer::new(quick_config(), kind, analysis);
        let first = splicer.begin_strand()?;
        let second = splicer.begin_strand()?;
        first.push_all([1, 5, 12, 15, 22])?;

        splicer.start_at(10)?;
        // the second strand hasn't shown anything yet
        assert_eq!(splicer.state(), SplicerState::Starting);
        splicer.stop_at(20)?;
        assert_eq!(splicer.state(), SplicerState::Stopping);
        second.push_all([3, 25])?;

        assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT), "{kind:?}");
        splicer.analyze()?;
        assert_eq!(*delivered.lock().unwrap(), vec![12, 15], "{kind:?}");
        assert_eq!(first.size(), 1, "{kind:?}");
        assert_eq!(second.size(), 1, "{kind:?}");
    }
    Ok(())
}

#[test]
fn test_clean_stop_behind_the_weaving_is_rejected() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let tail = splicer.begin_strand()?;
    tail.push_all([3, 9, 14])?;

    splicer.start()?;
    assert!(wait_until(|| splicer.stats().woven == 3));
    assert_matches!(splicer.stop_at(8), Err(Error::CutoffPassed { .. }));
    assert_eq!(splicer.state(), SplicerState::Started);

    splicer.stop_at(14)?;
    tail.push(20)?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), vec![3, 9, 14]);
    assert_eq!(tail.size(), 1);
    Ok(())
}

#[test]
fn test_clean_start_waits_for_the_latest_strand() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;
    first.push_all([1, 2, 5, 10, i64::last()])?;
    second.push_all([4, 6, 10, i64::last()])?;

    splicer.start_at(0)?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    // nothing before the first record every strand has seen
    assert_eq!(*delivered.lock().unwrap(), vec![4, 5, 6, 10, 10]);
    Ok(())
}

#[test]
fn test_clean_stop_then_resume() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;

    splicer.start()?;
    splicer.stop_at(5)?;
    first.push_all([1, 2, 3, 6, 7])?;
    second.push_all([2, 4, 5, 8])?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), vec![1, 2, 2, 3, 4, 5]);
    assert_eq!(first.size(), 2);
    assert_eq!(second.size(), 1);

    splicer.start()?;
    first.push_all([9, i64::last()])?;
    second.push_all([9, i64::last()])?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(
        *delivered.lock().unwrap(),
        vec![1, 2, 2, 3, 4, 5, 6, 7, 8, 9, 9]
    );
    Ok(())
}

#[test]
fn test_frayed_stop_keeps_unwoven_records() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;
    first.push_all([1, 2, 3])?;

    splicer.start()?;
    splicer.stop()?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert!(delivered.lock().unwrap().is_empty());
    assert_eq!(first.size(), 3);

    second.push_all([0, i64::last()])?;
    first.push(i64::last())?;
    splicer.start()?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_truncation_from_the_analysis() -> eyre::Result<()> {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let removed = Arc::new(Mutex::new(Vec::new()));
    let analysis = {
        let delivered = Arc::clone(&delivered);
        let mut cursor = 0usize;
        move |rope: &[i64], decrement: usize, handle: &SplicerHandle<i64>| {
            cursor = cursor.saturating_sub(decrement);
            delivered.lock().unwrap().extend_from_slice(&rope[cursor..]);
            cursor = rope.len();
            if let Some(last) = rope.last() {
                handle.truncate(*last)?;
            }
            Ok(())
        }
    };
    let splicer = Splicer::new(quick_config(), WeaverKind::Tree, analysis);
    {
        let removed = Arc::clone(&removed);
        splicer.add_listener(move |event| {
            if let SplicerEvent::Truncated { removed: records, .. } = event {
                removed.lock().unwrap().extend_from_slice(records);
            }
        });
    }
    let tail = splicer.begin_strand()?;
    splicer.start()?;
    for record in 1..=10 {
        tail.push(record)?;
    }
    tail.push(i64::last())?;

    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    assert_eq!(splicer.rope()?, vec![10]);
    assert_eq!(*removed.lock().unwrap(), (1..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_failing_analysis_doesnt_stop_weaving() -> eyre::Result<()> {
    let splicer = Splicer::new(
        quick_config(),
        WeaverKind::TwoPass,
        |_rope: &[i64], _decrement, _handle: &SplicerHandle<i64>| Err("no luck".into()),
    );
    let tail = splicer.begin_strand()?;
    tail.push_all([1, 2, i64::last()])?;
    splicer.start()?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    splicer.analyze()?;

    let stats = splicer.stats();
    assert_eq!(stats.woven, 2);
    assert!(stats.rope.analysis_failures >= 1);
    assert_eq!(stats.rope.analysis_failures, stats.rope.analysis_calls);
    Ok(())
}

/// Emits its records as a single batch without looking at them.
#[derive(Debug)]
struct Unchecked(Vec<i64>);

impl Weaver<i64> for Unchecked {
    fn name(&self) -> &'static str {
        "unchecked"
    }

    fn begin(&mut self, _strands: &[Strand<i64>]) {}

    fn weave(
        &mut self,
        _strands: &[Strand<i64>],
        _limit: Option<&i64>,
        rope: &mut Vec<i64>,
    ) -> Progress {
        if self.0.is_empty() {
            return Progress::Idle;
        }
        let count = self.0.len();
        rope.append(&mut self.0);
        Progress::Woven(count)
    }

    fn retains_beyond(&self, _strands: &[Strand<i64>], _cutoff: &i64) -> bool {
        false
    }

    fn end(&mut self) {}

    fn stalled_strand(&self, _strands: &[Strand<i64>]) -> Option<StrandId> {
        None
    }
}

#[test]
fn test_unordered_batch_fails_the_splicer() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::with_weaver(quick_config(), Box::new(Unchecked(vec![3, 1])), analysis);
    let transitions = record_transitions(&splicer);

    splicer.start()?;
    assert!(splicer.wait_for_state(SplicerState::Failed, WAIT));
    splicer.analyze()?;
    assert!(delivered.lock().unwrap().is_empty());
    assert_eq!(splicer.stats().defects, 1);
    assert_eq!(splicer.stats().weaver, "unchecked");

    splicer.force_stop()?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    assert!(wait_until(|| transitions.lock().unwrap().len() == 5));
    assert_eq!(
        transitions.lock().unwrap()[2..],
        [
            (SplicerState::Started, SplicerState::Failed),
            (SplicerState::Failed, SplicerState::Stopping),
            (SplicerState::Stopping, SplicerState::Stopped),
        ]
    );
    splicer.dispose()?;
    Ok(())
}

#[test]
fn test_force_stop_when_stopped_is_a_no_op() -> eyre::Result<()> {
    let (_delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    splicer.force_stop()?;
    assert_eq!(splicer.state(), SplicerState::Stopped);
    assert_matches!(splicer.stop(), Err(Error::IllegalTransition { .. }));
    Ok(())
}

#[test]
fn test_reports_the_blocking_strand() -> eyre::Result<()> {
    let (_delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;
    first.push_all([1, 2])?;

    splicer.start()?;
    assert_eq!(splicer.blocking_strand(), Some(second.id()));
    assert_eq!(splicer.state(), SplicerState::Starting);

    second.push(1)?;
    assert!(splicer.wait_for_state(SplicerState::Started, WAIT));
    Ok(())
}

#[test]
fn test_closed_strands_are_forgotten() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(quick_config(), WeaverKind::TwoPass, analysis);
    let first = splicer.begin_strand()?;
    let second = splicer.begin_strand()?;
    assert_eq!(splicer.strand_count(), 2);

    second.close();
    assert!(wait_until(|| splicer.strand_count() == 1));
    assert_matches!(second.push(1), Err(Error::StrandClosed));

    // a closed strand with records stays until they are woven
    first.push_all([1, 2])?;
    first.close();
    assert_eq!(splicer.strand_count(), 1);
    splicer.start()?;
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    assert!(wait_until(|| splicer.strand_count() == 0));
    splicer.analyze()?;
    assert_eq!(*delivered.lock().unwrap(), vec![1, 2]);
    Ok(())
}

#[test]
fn test_closed_strand_leaves_a_running_splicer() -> eyre::Result<()> {
    for kind in [WeaverKind::TwoPass, WeaverKind::Tree] {
        let (delivered, analysis) = recording_analysis();
        let splicer = Splicer::new(quick_config(), kind, analysis);
        let first = splicer.begin_strand()?;
        let second = splicer.begin_strand()?;
        first.push_all([1, 2])?;
        second.push(1)?;

        splicer.start()?;
        assert!(wait_until(|| splicer.stats().woven == 2), "{kind:?}");
        second.close();
        assert!(wait_until(|| splicer.strand_count() == 1), "{kind:?}");
        assert_eq!(splicer.state(), SplicerState::Started);

        first.close();
        assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT), "{kind:?}");
        assert_eq!(splicer.strand_count(), 0);
        splicer.analyze()?;
        assert_eq!(*delivered.lock().unwrap(), vec![1, 1, 2], "{kind:?}");
    }
    Ok(())
}

#[test]
fn test_timeout_tree_starts_without_idle_strands() -> eyre::Result<()> {
    let (delivered, analysis) = recording_analysis();
    let splicer = Splicer::new(
        quick_config(),
        WeaverKind::TreeWithTimeout { max_idle_ticks: 3 },
        analysis,
    );
    let busy = splicer.begin_strand()?;
    let idle = splicer.begin_strand()?;
    busy.push_all([1, 2, 3])?;

    splicer.start()?;
    assert!(splicer.wait_for_state(SplicerState::Started, WAIT));
    assert!(wait_until(|| *delivered.lock().unwrap() == vec![1, 2, 3]));

    idle.close();
    busy.close();
    assert!(splicer.wait_for_state(SplicerState::Stopped, WAIT));
    Ok(())
}
