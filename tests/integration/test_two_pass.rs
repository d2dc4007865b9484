// Copyright © 2024 Pathway

use splicer_engine::engine::{Record, TotalFrontier};
use splicer_engine::strands::StrandId;
use splicer_engine::weaving::{Progress, TwoPassWeaver, Weaver};

use super::helpers::{detached_strand, weave_all};

#[test]
fn test_weaves_up_to_the_common_point() -> eyre::Result<()> {
    let (a, a_tail) = detached_strand(0);
    let (b, b_tail) = detached_strand(1);
    let strands = vec![a.clone(), b.clone()];
    let mut weaver = TwoPassWeaver::new();
    let mut rope = Vec::new();
    weaver.begin(&strands);

    a_tail.push_all([1, 3, 3, 4, 6])?;
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Idle);

    b_tail.push_all([8, 9, 9, 12])?;
    assert_eq!(
        TwoPassWeaver::greatest_common_point(&strands),
        Some(TotalFrontier::At(6))
    );
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Woven(5));
    assert!(a.is_empty());
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Idle);
    assert_eq!(weaver.stalled_strand(&strands), Some(StrandId(0)));

    a_tail.push(6)?;
    a_tail.push(6)?;
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Woven(2));

    a_tail.close();
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Woven(4));
    b_tail.push(i64::last())?;
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Exhausted);

    assert_eq!(rope, vec![1, 3, 3, 4, 6, 6, 6, 8, 9, 9, 12]);
    assert!(b.is_exhausted());
    Ok(())
}

#[test]
fn test_weaving_respects_limit() -> eyre::Result<()> {
    let (a, a_tail) = detached_strand(0);
    let (b, b_tail) = detached_strand(1);
    let strands = vec![a, b];
    a_tail.push_all([1, 4, 7, 10])?;
    b_tail.push_all([2, 5, 8, 11])?;

    let mut weaver = TwoPassWeaver::new();
    let mut rope = Vec::new();
    weaver.begin(&strands);
    assert_eq!(weaver.weave(&strands, Some(&5), &mut rope), Progress::Woven(4));
    assert_eq!(rope, vec![1, 2, 4, 5]);

    assert!(weaver.retains_beyond(&strands, &5));
    assert!(!weaver.retains_beyond(&strands, &7));
    Ok(())
}

#[test]
fn test_ended_strand_does_not_constrain() -> eyre::Result<()> {
    let (a, a_tail) = detached_strand(0);
    let (b, b_tail) = detached_strand(1);
    let strands = vec![a, b];
    a_tail.push_all([1, 2, i64::last()])?;

    let mut weaver = TwoPassWeaver::new();
    let mut rope = Vec::new();
    weaver.begin(&strands);
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Idle);

    b_tail.push_all([0, 5])?;
    assert_eq!(weaver.weave(&strands, None, &mut rope), Progress::Woven(4));
    assert_eq!(rope, vec![0, 1, 2, 5]);
    assert_eq!(weaver.stalled_strand(&strands), Some(StrandId(1)));
    Ok(())
}

#[test]
fn test_equal_records_keep_strand_order() -> eyre::Result<()> {
    let (a, a_tail) = detached_strand(0);
    let (b, b_tail) = detached_strand(1);
    a_tail.push_all([1, 2, 2])?;
    b_tail.push_all([2, 2, 3])?;
    a_tail.close();
    b_tail.close();

    let rope = weave_all(&mut TwoPassWeaver::new(), &[a, b]);
    assert_eq!(rope, vec![1, 2, 2, 2, 2, 3]);
    Ok(())
}

#[test]
fn test_no_strands_is_idle() {
    let mut weaver = TwoPassWeaver::new();
    let mut rope: Vec<i64> = Vec::new();
    Weaver::<i64>::begin(&mut weaver, &[]);
    assert_eq!(weaver.weave(&[], None, &mut rope), Progress::Idle);
    assert_eq!(weaver.idle_cycles(), 1);
}

#[test]
fn test_run_ends_once_every_strand_is_forgotten() {
    let (strand, tail) = detached_strand(0);
    tail.close();
    let mut weaver = TwoPassWeaver::new();
    let mut rope: Vec<i64> = Vec::new();
    weaver.begin(&[strand]);
    // the splicer dropped the closed strand from its working set
    assert_eq!(weaver.weave(&[], None, &mut rope), Progress::Exhausted);
    assert!(rope.is_empty());
}

#[test]
fn test_frontier_bounds() {
    assert_eq!(TotalFrontier::At(6).limited_by(Some(&4)).as_bound(), Some(&4));
    assert_eq!(TotalFrontier::At(3).limited_by(Some(&4)), TotalFrontier::At(3));
    assert_eq!(TotalFrontier::Done.limited_by(None).as_bound(), None::<&i64>);
    assert!(TotalFrontier::At(i64::last()) < TotalFrontier::Done);
}
