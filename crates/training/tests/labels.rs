use training::labels::{
    all_sessions, parse_session_selection, session, Emotion, LabelSet, SESSION_COUNT,
};

#[test]
fn every_session_class_count_matches_its_label_set() {
    let sessions = all_sessions().expect("catalog");
    assert_eq!(sessions.len(), SESSION_COUNT as usize);
    for sess in sessions {
        assert_eq!(
            sess.num_classes,
            sess.label_set.len(),
            "session {} uses {}",
            sess.id,
            sess.label_set.name
        );
    }
}

#[test]
fn catalog_assigns_expected_label_sets() {
    let cases = [
        (1, "B", 3),
        (3, "C", 6),
        (5, "D", 7),
        (7, "E", 5),
        (11, "F", 5),
        (14, "H", 6),
        (18, "Q", 5),
        (28, "M", 5),
        (31, "B", 3),
        (32, "L", 4),
        (33, "N", 5),
        (37, "R", 5),
        (38, "P", 4),
        (40, "D", 7),
    ];
    for (id, name, classes) in cases {
        let sess = session(id).expect("session");
        assert_eq!(sess.label_set.name, name, "session {id}");
        assert_eq!(sess.num_classes, classes, "session {id}");
    }
}

#[test]
fn out_of_range_session_ids_are_errors() {
    assert!(session(0).is_err());
    assert!(session(41).is_err());
}

#[test]
fn class_indices_follow_label_set_order() {
    let q = LabelSet::Q;
    assert_eq!(q.class_index(Emotion::Disgust), Some(0));
    assert_eq!(q.class_index(Emotion::Neutral), Some(3));
    assert_eq!(q.class_index(Emotion::Angry), None);
    assert_eq!(q.emotion(1), Some(Emotion::Fear));
    assert_eq!(q.emotion(5), None);

    let b = LabelSet::by_name("LABELDICT_B").expect("set");
    assert_eq!(b.class_names(), vec!["neutral", "happy", "surprise"]);
}

#[test]
fn emotion_names_parse_including_dataset_spelling() {
    assert_eq!("Disqust".parse::<Emotion>().expect("emotion"), Emotion::Disgust);
    assert_eq!("HAPPY".parse::<Emotion>().expect("emotion"), Emotion::Happy);
    assert!("bored".parse::<Emotion>().is_err());
    assert_eq!(Emotion::from_code(6), Some(Emotion::Fear));
    assert_eq!(Emotion::Sad.code(), 5);
}

#[test]
fn session_selection_is_sorted_and_deduplicated() {
    let ids: Vec<u32> = parse_session_selection("8, 3-5,4,40")
        .expect("selection")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec![3, 4, 5, 8, 40]);

    assert_eq!(parse_session_selection("").expect("all").len(), 40);
    assert!(parse_session_selection("5-3").is_err());
    assert!(parse_session_selection("0").is_err());
    assert!(parse_session_selection("x").is_err());
}
