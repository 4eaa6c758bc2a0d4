//! Experiment index: registration, ordering, conflicts and release lookup

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use trueno_ab::experiment::{Experiment, ExperimentBuilder, Release};
use trueno_ab::index::{ClaimPolicy, ExperimentIndex, Stickiness};
use trueno_ab::{Assignment, Error, Subject};

fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn build(builder: ExperimentBuilder) -> Arc<Experiment> {
    Arc::new(builder.build())
}

fn index_of(experiments: &[&Arc<Experiment>]) -> ExperimentIndex {
    let mut index = ExperimentIndex::new();
    for x in experiments {
        assert!(index.add(Arc::clone(x)).unwrap());
    }
    index
}

#[test]
fn test_get_by_name() {
    let x = build(Experiment::builder("foo"));
    let index = index_of(&[&x]);
    assert!(Arc::ptr_eq(index.get("foo").unwrap(), &x));
    assert!(index.get("bar").is_none());
}

#[test]
fn test_get_by_variable() {
    let x = build(Experiment::builder("foo").independent_variables(["bar"]));
    let index = index_of(&[&x]);
    assert!(Arc::ptr_eq(&index.get_by_variable("bar")[0], &x));
    assert!(index.get_by_variable("baz").is_empty());
}

#[test]
fn test_shared_variables_allowed() {
    let x1 = build(Experiment::builder("foo").independent_variables(["bar"]));
    let x2 = build(Experiment::builder("baz").independent_variables(["bar"]));
    let index = index_of(&[&x1, &x2]);
    assert_eq!(index.get_by_variable("bar").len(), 2);
    assert!(x1.conflicts_with_name("baz"));
    assert!(x2.conflicts_with_name("foo"));
}

#[test]
fn test_duplicate_name_keeps_first() {
    let x1 = build(Experiment::builder("foo").independent_variables(["bar"]));
    let x2 = build(Experiment::builder("foo").independent_variables(["bar"]));
    let mut index = ExperimentIndex::new();
    assert!(index.add(Arc::clone(&x1)).unwrap());
    assert!(!index.add(Arc::clone(&x2)).unwrap());
    assert_eq!(index.filter(|_| true).len(), 1);
    assert!(Arc::ptr_eq(index.get("foo").unwrap(), &x1));
    assert_eq!(index.get_by_variable("bar").len(), 1);
    assert!(x1.conflicts_with().is_empty());
}

#[test]
fn test_report_only_active() {
    let x1 = build(
        Experiment::builder("foo")
            .independent_variables(["bar"])
            .grouping(|_, _| Ok(Assignment::from([("bar".to_string(), json!("x"))]))),
    );
    let x2 = build(Experiment::builder("baz").independent_variables(["bar"]));
    let index = index_of(&[&x1, &x2]);
    x1.choose(&Subject::new(), Utc::now()).unwrap();

    let report = index.report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].name(), "foo");
    assert_eq!(report[0].choice("").unwrap()["bar"], json!("x"));
}

#[test]
fn test_add_sorts_by_start_date() {
    let x1 = build(
        Experiment::builder("foo")
            .start_date(date(2014, 1, 1))
            .independent_variables(["bar"]),
    );
    let x2 = build(
        Experiment::builder("baz")
            .start_date(date(2013, 1, 1))
            .independent_variables(["bar"]),
    );
    let x3 = build(
        Experiment::builder("bae")
            .start_date(date(2014, 1, 2))
            .independent_variables(["bar"]),
    );
    let index = index_of(&[&x1, &x2, &x3]);
    let names: Vec<&str> = index
        .get_by_variable("bar")
        .iter()
        .map(|x| x.name())
        .collect();
    assert_eq!(names, vec!["baz", "foo", "bae"]);
}

#[test]
fn test_order_independent_of_registration() {
    let start = date(2014, 1, 1);
    let make = |name: &str| {
        build(
            Experiment::builder(name)
                .start_date(start)
                .independent_variables(["bar"]),
        )
    };
    let (a, b, c) = (make("a"), make("b"), make("c"));
    let forward = index_of(&[&a, &b, &c]);
    let backward = index_of(&[&c, &b, &a]);
    let names = |index: &ExperimentIndex| -> Vec<String> {
        index
            .get_by_variable("bar")
            .iter()
            .map(|x| x.name().to_string())
            .collect()
    };
    assert_eq!(names(&forward), names(&backward));
}

#[test]
fn test_first_eligible_is_earliest_eligible() {
    let x1 = build(
        Experiment::builder("foo")
            .start_date(date(2014, 1, 1))
            .independent_variables(["bar"])
            .always_eligible(),
    );
    let x2 = build(
        Experiment::builder("baz")
            .start_date(date(2013, 1, 1))
            .independent_variables(["bar"]),
    );
    let first = build(
        Experiment::builder("boz")
            .start_date(date(2013, 12, 31))
            .independent_variables(["bar"])
            .always_eligible(),
    );
    let index = index_of(&[&x1, &x2, &first]);
    let enrolled = ExperimentIndex::new();
    let found = index
        .get_first_eligible("bar", &Subject::new(), &enrolled, date(2014, 6, 1))
        .unwrap();
    assert!(Arc::ptr_eq(found, &first));
}

#[test]
fn test_conflicting_experiments_yield_to_enrolled() {
    let x = build(
        Experiment::builder("X")
            .start_date(date(2014, 1, 1))
            .end_date(date(2014, 2, 1))
            .independent_variables(["a", "b"])
            .always_eligible(),
    );
    let y = build(
        Experiment::builder("Y")
            .start_date(date(2014, 1, 2))
            .end_date(date(2014, 2, 2))
            .independent_variables(["b", "c"])
            .always_eligible(),
    );
    let z = build(
        Experiment::builder("Z")
            .start_date(date(2014, 1, 3))
            .end_date(date(2014, 2, 3))
            .independent_variables(["c"])
            .always_eligible(),
    );
    let (t0, t1, t2) = (date(2014, 1, 1), date(2014, 1, 2), date(2014, 1, 3));
    let index = index_of(&[&x, &y, &z]);
    let mut enrolled = ExperimentIndex::new();
    let nobody = Subject::new();

    let initial = index.get_first_eligible("b", &nobody, &enrolled, t0).unwrap();
    assert!(Arc::ptr_eq(initial, &x));

    enrolled.enroll(Arc::clone(&x), None);
    let consistent = index.get_first_eligible("b", &nobody, &enrolled, t2).unwrap();
    assert!(Arc::ptr_eq(consistent, &x));
    assert!(index.get_first_eligible("c", &nobody, &enrolled, t1).is_none());
    let free = index.get_first_eligible("c", &nobody, &enrolled, t2).unwrap();
    assert!(Arc::ptr_eq(free, &z));
}

#[test]
fn test_failing_eligibility_skips_to_next() {
    let broken = build(
        Experiment::builder("broken")
            .start_date(date(2013, 1, 1))
            .independent_variables(["bar"])
            .eligibility(|_| anyhow::bail!("boom")),
    );
    let ok = build(
        Experiment::builder("ok")
            .start_date(date(2014, 1, 1))
            .independent_variables(["bar"])
            .always_eligible(),
    );
    let index = index_of(&[&broken, &ok]);
    let found = index
        .get_first_eligible("bar", &Subject::new(), &ExperimentIndex::new(), date(2014, 6, 1))
        .unwrap();
    assert_eq!(found.name(), "ok");
}

#[test]
fn test_get_released_most_recent() {
    let x1 = build(
        Experiment::builder("foo")
            .end_date(date(2014, 1, 1))
            .independent_variables(["bar"]),
    );
    let x2 = build(
        Experiment::builder("baz")
            .end_date(date(2014, 12, 31))
            .independent_variables(["bar"]),
    );
    let x3 = build(
        Experiment::builder("bae")
            .end_date(date(2014, 6, 1))
            .independent_variables(["bar"]),
    );
    let index = index_of(&[&x1, &x2, &x3]);
    assert!(Arc::ptr_eq(
        index.get_released("bar", date(2014, 12, 30)).unwrap(),
        &x3
    ));
    assert!(Arc::ptr_eq(
        index.get_released("bar", date(2015, 1, 1)).unwrap(),
        &x2
    ));
}

#[test]
fn test_get_released_none() {
    let x1 = build(Experiment::builder("foo").independent_variables(["bar"]));
    let x2 = build(Experiment::builder("baz").independent_variables(["bar"]));
    let index = index_of(&[&x1, &x2]);
    assert!(index.get_released("bar", date(2015, 1, 1)).is_none());
}

#[test]
fn test_get_released_includes_ramping() {
    let ramp = build(
        Experiment::builder("ramp")
            .independent_variables(["bar"])
            .release(Release::new(date(2015, 1, 1), date(2015, 2, 1))),
    );
    let index = index_of(&[&ramp]);
    assert!(index.get_released("bar", date(2014, 12, 31)).is_none());
    assert!(index.get_released("bar", date(2015, 1, 2)).is_some());
}

#[test]
fn test_attributes_and_variables_are_sorted_unions() {
    let x1 = build(
        Experiment::builder("foo")
            .subject_attributes(["id", "country"])
            .independent_variables(["b", "a"]),
    );
    let x2 = build(
        Experiment::builder("bar")
            .subject_attributes(["id"])
            .independent_variables(["c"]),
    );
    let index = index_of(&[&x1, &x2]);
    assert_eq!(index.attributes(), vec!["country", "id"]);
    assert_eq!(index.variables(), vec!["a", "b", "c"]);
    assert_eq!(index.names(), vec!["bar", "foo"]);
}

#[test]
fn test_exclusive_claim_policy() {
    let mut index = ExperimentIndex::new().with_claim_policy(ClaimPolicy::Exclusive);
    index
        .add(build(Experiment::builder("first").independent_variables(["x"])))
        .unwrap();
    let err = index
        .add(build(Experiment::builder("second").independent_variables(["x"])))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::VariableAlreadyClaimed { ref variable, ref owner, ref claimant }
            if variable == "x" && owner == "first" && claimant == "second"
    ));
    assert!(!err.is_recoverable());
}

#[test]
fn test_subject_stickiness_scopes_conflicts() {
    let x = build(
        Experiment::builder("X")
            .subject_attributes(["id"])
            .independent_variables(["a"])
            .always_eligible(),
    );
    let y = build(
        Experiment::builder("Y")
            .start_date(date(2014, 1, 1))
            .subject_attributes(["id"])
            .independent_variables(["a"])
            .always_eligible(),
    );
    let index = index_of(&[&x, &y]);
    let mut enrolled = ExperimentIndex::new().with_stickiness(Stickiness::Subject);
    let alice = Subject::from([("id".to_string(), json!("alice"))]);
    let bob = Subject::from([("id".to_string(), json!("bob"))]);
    enrolled.enroll(Arc::clone(&y), Some(y.key(&alice)));

    let now = date(2014, 6, 1);
    // alice is committed to Y, so X (which conflicts) is skipped
    let for_alice = index.get_first_eligible("a", &alice, &enrolled, now).unwrap();
    assert_eq!(for_alice.name(), "Y");
    assert!(enrolled.get_first_live_for("a", &alice, now).is_some());
    // bob is not committed anywhere
    let for_bob = index.get_first_eligible("a", &bob, &enrolled, now).unwrap();
    assert_eq!(for_bob.name(), "X");
    assert!(enrolled.get_first_live_for("a", &bob, now).is_none());
}
