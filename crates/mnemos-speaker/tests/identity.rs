use std::path::Path;
use std::sync::Arc;
use std::thread;

use mnemos_speaker::{SpeakerConfig, SpeakerError, SpeakerIdentity, SpeakerLabel};
use mnemos_types::MonotonicId;

const VOICE_A: [f32; 3] = [1.0, 0.0, 0.0];
const VOICE_B: [f32; 3] = [0.0, 1.0, 0.0];
const VOICE_C: [f32; 3] = [0.0, 0.0, 1.0];

fn open(dir: &Path) -> SpeakerIdentity {
    SpeakerIdentity::open(
        dir,
        &SpeakerConfig {
            embedding_dim: 3,
            threshold: 0.5,
        },
    )
    .unwrap()
}

#[test]
fn near_voice_reidentifies_without_new_row() {
    let dir = tempfile::tempdir().unwrap();
    let ids = open(dir.path());
    let first = ids.identify_or_enroll(&VOICE_A).unwrap();
    let again = ids.identify_or_enroll(&[0.95, 0.1, 0.0]).unwrap();

    assert_eq!(first, again);
    assert_eq!(ids.unknown_store().count().unwrap(), 1);
}

#[test]
fn promoted_speaker_is_recognised_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let ids = open(dir.path());
    for voice in [VOICE_A, VOICE_B, VOICE_C] {
        ids.identify_or_enroll(&voice).unwrap();
    }
    assert_eq!(
        ids.identify(&VOICE_C).unwrap(),
        Some(SpeakerLabel::Unknown(MonotonicId(3)))
    );

    let promoted = ids.promote("Unknown Speaker 3", "Ada").unwrap();
    assert_eq!(promoted, SpeakerLabel::Known("Ada".into()));

    assert_eq!(
        ids.identify_or_enroll(&[0.05, 0.0, 1.0]).unwrap(),
        SpeakerLabel::Known("Ada".into())
    );
    assert!(!ids.unknown_labels().unwrap().contains(&SpeakerLabel::Unknown(MonotonicId(3))));
    assert!(matches!(
        ids.unknown_embedding("Unknown Speaker 3"),
        Err(SpeakerError::UnknownLabel(MonotonicId(3)))
    ));
    assert_eq!(ids.known_names().unwrap(), vec!["Ada"]);
}

#[test]
fn labels_are_not_reused_after_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let ids = open(dir.path());
    let label = ids.identify_or_enroll(&VOICE_A).unwrap();
    ids.promote(&label.to_string(), "Grace").unwrap();

    let next = ids.identify_or_enroll(&VOICE_B).unwrap();
    assert_eq!(next, SpeakerLabel::Unknown(MonotonicId(2)));
    drop(ids);

    let reopened = open(dir.path());
    assert_eq!(
        reopened.identify_or_enroll(&VOICE_C).unwrap(),
        SpeakerLabel::Unknown(MonotonicId(3))
    );
}

#[test]
fn forgetting_a_name_turns_the_voice_back_into_a_stranger() {
    let dir = tempfile::tempdir().unwrap();
    let ids = open(dir.path());
    ids.enroll_known("Linus", &VOICE_B, true).unwrap();
    assert_eq!(
        ids.identify_or_enroll(&VOICE_B).unwrap(),
        SpeakerLabel::Known("Linus".into())
    );

    assert_eq!(ids.forget("Linus").unwrap(), 1);
    assert!(!ids.identify_or_enroll(&VOICE_B).unwrap().is_known());
}

#[test]
fn second_instance_sees_enrolments_of_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let a = open(dir.path());
    let b = open(dir.path());

    let label = a.identify_or_enroll(&VOICE_A).unwrap();
    assert_eq!(b.identify_or_enroll(&VOICE_A).unwrap(), label);

    b.promote(&label.to_string(), "Ada").unwrap();
    assert_eq!(a.identify(&VOICE_A).unwrap(), Some(SpeakerLabel::Known("Ada".into())));
}

#[test]
fn concurrent_first_sightings_share_one_label() {
    let dir = tempfile::tempdir().unwrap();
    let instances: Vec<Arc<SpeakerIdentity>> = (0..4).map(|_| Arc::new(open(dir.path()))).collect();

    let labels: Vec<SpeakerLabel> = instances
        .iter()
        .map(|ids| {
            let ids = Arc::clone(ids);
            thread::spawn(move || ids.identify_or_enroll(&VOICE_C).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert!(labels.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(instances[0].unknown_store().count().unwrap(), 1);
}
