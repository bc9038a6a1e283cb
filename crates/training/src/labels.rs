//! Emotion vocabulary and the per-session label spaces.
//!
//! Every session is annotated with a subset of the seven canonical emotions.
//! The subset is named by a [`LabelSet`]; the position of an emotion inside
//! its set is the class index the classifier is trained against. Data files
//! store canonical [`Emotion`] codes, which are remapped through the session's
//! set when batches are built.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::Serialize;

use crate::TrainingError;

pub const SESSION_COUNT: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Neutral,
    Happy,
    Angry,
    Surprise,
    Disgust,
    Sad,
    Fear,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Angry,
        Emotion::Surprise,
        Emotion::Disgust,
        Emotion::Sad,
        Emotion::Fear,
    ];

    /// Canonical on-disk code.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Angry => "angry",
            Emotion::Surprise => "surprise",
            Emotion::Disgust => "disgust",
            Emotion::Sad => "sad",
            Emotion::Fear => "fear",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Emotion {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neutral" => Ok(Emotion::Neutral),
            "happy" => Ok(Emotion::Happy),
            "angry" => Ok(Emotion::Angry),
            "surprise" => Ok(Emotion::Surprise),
            // the corpus annotations spell it this way
            "disgust" | "disqust" => Ok(Emotion::Disgust),
            "sad" => Ok(Emotion::Sad),
            "fear" => Ok(Emotion::Fear),
            other => Err(TrainingError::data(format!("unknown emotion '{other}'"))),
        }
    }
}

use Emotion::{Angry, Disgust, Fear, Happy, Neutral, Sad, Surprise};

/// Named, ordered subset of emotions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LabelSet {
    pub name: &'static str,
    #[serde(skip)]
    emotions: &'static [Emotion],
}

impl LabelSet {
    pub const A: LabelSet = LabelSet::new("A", &[Neutral, Happy, Angry, Surprise]);
    pub const B: LabelSet = LabelSet::new("B", &[Neutral, Happy, Surprise]);
    pub const C: LabelSet = LabelSet::new("C", &[Neutral, Happy, Angry, Surprise, Disgust, Sad]);
    pub const D: LabelSet = LabelSet::new(
        "D",
        &[Neutral, Happy, Angry, Surprise, Disgust, Sad, Fear],
    );
    pub const E: LabelSet = LabelSet::new("E", &[Neutral, Happy, Angry, Surprise, Disgust]);
    pub const F: LabelSet = LabelSet::new("F", &[Neutral, Happy, Surprise, Sad, Fear]);
    pub const G: LabelSet = LabelSet::new("G", &[Neutral, Happy, Angry, Surprise, Sad, Fear]);
    pub const H: LabelSet = LabelSet::new("H", &[Neutral, Happy, Angry, Disgust, Sad, Fear]);
    pub const I: LabelSet = LabelSet::new("I", &[Neutral, Happy, Angry, Surprise, Sad]);
    pub const J: LabelSet = LabelSet::new("J", &[Neutral, Happy, Surprise, Disgust, Sad, Fear]);
    pub const K: LabelSet = LabelSet::new("K", &[Neutral, Happy, Angry, Surprise, Disgust, Fear]);
    pub const L: LabelSet = LabelSet::new("L", &[Neutral, Happy, Surprise, Disgust]);
    pub const M: LabelSet = LabelSet::new("M", &[Neutral, Happy, Angry, Surprise, Fear]);
    pub const N: LabelSet = LabelSet::new("N", &[Neutral, Happy, Surprise, Disgust, Fear]);
    pub const P: LabelSet = LabelSet::new("P", &[Neutral, Happy, Surprise, Sad]);
    pub const Q: LabelSet = LabelSet::new("Q", &[Disgust, Fear, Happy, Neutral, Sad]);
    pub const R: LabelSet = LabelSet::new("R", &[Disgust, Happy, Neutral, Sad, Surprise]);

    pub const ALL: [LabelSet; 17] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
        Self::I,
        Self::J,
        Self::K,
        Self::L,
        Self::M,
        Self::N,
        Self::P,
        Self::Q,
        Self::R,
    ];

    const fn new(name: &'static str, emotions: &'static [Emotion]) -> Self {
        Self { name, emotions }
    }

    pub fn by_name(name: &str) -> Option<LabelSet> {
        let wanted = name.trim().trim_start_matches("LABELDICT_");
        Self::ALL
            .iter()
            .copied()
            .find(|set| set.name.eq_ignore_ascii_case(wanted))
    }

    pub fn len(&self) -> usize {
        self.emotions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emotions.is_empty()
    }

    pub fn emotions(&self) -> &'static [Emotion] {
        self.emotions
    }

    pub fn class_index(&self, emotion: Emotion) -> Option<usize> {
        self.emotions.iter().position(|e| *e == emotion)
    }

    pub fn emotion(&self, class: usize) -> Option<Emotion> {
        self.emotions.get(class).copied()
    }

    pub fn class_names(&self) -> Vec<&'static str> {
        self.emotions.iter().map(|e| e.name()).collect()
    }
}

/// One annotated session and the label space it is trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSpec {
    pub id: u32,
    pub label_set: LabelSet,
    pub num_classes: usize,
}

impl SessionSpec {
    pub fn train_split(&self) -> String {
        format!("train_{:02}", self.id)
    }

    pub fn dev_split(&self) -> String {
        format!("dev_{:02}", self.id)
    }
}

const SESSION_TABLE: [(LabelSet, usize); SESSION_COUNT as usize] = [
    (LabelSet::B, 3),
    (LabelSet::B, 3),
    (LabelSet::C, 6),
    (LabelSet::C, 6),
    (LabelSet::D, 7),
    (LabelSet::D, 7),
    (LabelSet::E, 5),
    (LabelSet::C, 6),
    (LabelSet::C, 6),
    (LabelSet::D, 7),
    (LabelSet::F, 5),
    (LabelSet::G, 6),
    (LabelSet::D, 7),
    (LabelSet::H, 6),
    (LabelSet::D, 7),
    (LabelSet::D, 7),
    (LabelSet::I, 5),
    (LabelSet::Q, 5),
    (LabelSet::C, 6),
    (LabelSet::I, 5),
    (LabelSet::D, 7),
    (LabelSet::C, 6),
    (LabelSet::E, 5),
    (LabelSet::D, 7),
    (LabelSet::D, 7),
    (LabelSet::G, 6),
    (LabelSet::C, 6),
    (LabelSet::M, 5),
    (LabelSet::D, 7),
    (LabelSet::C, 6),
    (LabelSet::B, 3),
    (LabelSet::L, 4),
    (LabelSet::N, 5),
    (LabelSet::M, 5),
    (LabelSet::E, 5),
    (LabelSet::I, 5),
    (LabelSet::R, 5),
    (LabelSet::P, 4),
    (LabelSet::C, 6),
    (LabelSet::D, 7),
];

/// Looks up a session by its 1-based id.
pub fn session(id: u32) -> Result<SessionSpec, TrainingError> {
    if id == 0 || id > SESSION_COUNT {
        return Err(TrainingError::validation(vec![format!(
            "session id {id} is outside 1..={SESSION_COUNT}"
        )]));
    }
    let (label_set, num_classes) = SESSION_TABLE[(id - 1) as usize];
    if label_set.len() != num_classes {
        return Err(TrainingError::initialization(format!(
            "session {id} declares {num_classes} classes but label set {} has {}",
            label_set.name,
            label_set.len()
        )));
    }
    Ok(SessionSpec {
        id,
        label_set,
        num_classes,
    })
}

pub fn all_sessions() -> Result<Vec<SessionSpec>, TrainingError> {
    (1..=SESSION_COUNT).map(session).collect()
}

/// Parses selections such as `"1-5,8,40"` into sorted, unique session specs.
/// An empty string selects every session.
pub fn parse_session_selection(selection: &str) -> Result<Vec<SessionSpec>, TrainingError> {
    let trimmed = selection.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return all_sessions();
    }

    let mut ids = BTreeSet::new();
    for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start = parse_id(start)?;
            let end = parse_id(end)?;
            if start > end {
                return Err(TrainingError::validation(vec![format!(
                    "session range '{part}' is reversed"
                )]));
            }
            ids.extend(start..=end);
        } else {
            ids.insert(parse_id(part)?);
        }
    }

    ids.into_iter().map(session).collect()
}

fn parse_id(raw: &str) -> Result<u32, TrainingError> {
    raw.trim().parse::<u32>().map_err(|err| {
        TrainingError::validation(vec![format!("invalid session id '{}': {err}", raw.trim())])
    })
}
