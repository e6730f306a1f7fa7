use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{error::SplicerError, persistence, routing::PortRef};

pub const SESSION_FILE_NAME: &str = "session.json";
pub const DEFAULT_TRACK_CHANNELS: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IoSpec {
    /// Engine-native input/output string, passed through untouched.
    Direct(String),
    /// External fabric endpoint wired to an engine port named after the track.
    RoutingPort(PortRef),
    File(PathBuf),
    Loop,
    /// Hardware playback ports of the routing fabric.
    Master,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub name: String,
    pub channels: u16,
    #[serde(default)]
    pub input: Vec<IoSpec>,
    #[serde(default)]
    pub output: Vec<IoSpec>,
    #[serde(default)]
    pub operators: Vec<String>,
    pub record: bool,
    pub monitor: bool,
    pub selected_take: u32,
    pub next_take: u32,
    #[serde(skip)]
    pub dirty: bool,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Result<Self, SplicerError> {
        let name = name.into();
        validate_name("track", &name)?;
        Ok(Self {
            name,
            channels: DEFAULT_TRACK_CHANNELS,
            input: Vec::new(),
            output: Vec::new(),
            operators: Vec::new(),
            record: false,
            monitor: false,
            selected_take: 0,
            next_take: 1,
            dirty: false,
        })
    }

    #[must_use]
    pub fn take_file_name(&self, take: u32) -> String {
        format!("{}.take-{take}.wav", self.name)
    }

    /// Moves the selection onto the take that was just recorded. Fails without changing
    /// anything once take numbers are exhausted.
    pub fn complete_take(&mut self) -> Result<(), SplicerError> {
        let following = self.following_take()?;
        self.selected_take = self.next_take;
        self.next_take = following;
        self.dirty = true;
        Ok(())
    }

    fn following_take(&self) -> Result<u32, SplicerError> {
        self.next_take.checked_add(1).ok_or_else(|| {
            SplicerError::configuration(format!("track {} has run out of take numbers", self.name))
        })
    }

    fn check_loaded(&self, key: &str) -> Result<(), SplicerError> {
        validate_name("track", &self.name)?;
        if self.name != key {
            return Err(SplicerError::configuration(format!(
                "track {:?} is stored under {key:?}",
                self.name
            )));
        }
        if self.next_take == 0 || self.next_take <= self.selected_take {
            return Err(SplicerError::configuration(format!(
                "track {} has take {} selected but next take {}",
                self.name, self.selected_take, self.next_take
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub name: String,
    #[serde(skip)]
    directory: PathBuf,
    tracks: BTreeMap<String, Track>,
    selected_track: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Looks up `<root>/<name>`, creating the directory and an empty session when absent.
    #[instrument(fields(root = %root.display(), name = %name))]
    pub fn open_or_create(root: &Path, name: &str) -> Result<Self, SplicerError> {
        validate_name("session", name)?;
        let directory = root.join(name);

        if directory.exists() && !directory.is_dir() {
            return Err(SplicerError::configuration(format!(
                "session path exists and is not a directory: {}",
                directory.display()
            )));
        }
        fs::create_dir_all(&directory).with_context(|| {
            format!(
                "failed to create session directory: {}",
                directory.display()
            )
        })?;

        let state_path = directory.join(SESSION_FILE_NAME);
        if state_path.is_file() {
            let mut session = persistence::load_session(&state_path)?;
            session.check_loaded()?;
            session.directory = directory;
            info!(tracks = session.tracks.len(), "session opened");
            return Ok(session);
        }

        let now = Utc::now();
        info!("session created");
        Ok(Self {
            name: name.to_string(),
            directory,
            tracks: BTreeMap::new(),
            selected_track: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn check_loaded(&self) -> Result<(), SplicerError> {
        validate_name("session", &self.name)?;
        for (key, track) in &self.tracks {
            track.check_loaded(key)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    #[must_use]
    pub fn track(&self, name: &str) -> Option<&Track> {
        self.tracks.get(name)
    }

    pub fn track_mut(&mut self, name: &str) -> Option<&mut Track> {
        self.tracks.get_mut(name)
    }

    /// Returns the named track, creating it on first reference.
    pub fn track_or_create(&mut self, name: &str) -> Result<&mut Track, SplicerError> {
        if !self.tracks.contains_key(name) {
            let track = Track::new(name)?;
            debug!(track = %name, "track created");
            self.tracks.insert(name.to_string(), track);
            self.touch();
        }
        self.tracks
            .get_mut(name)
            .ok_or_else(|| SplicerError::configuration(format!("track vanished: {name}")))
    }

    pub fn remove_track(&mut self, name: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|track_name, _| track_name != name);
        if self.selected_track.as_deref() == Some(name) {
            self.selected_track = None;
        }
        let removed = self.tracks.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    pub fn select_track(&mut self, name: &str) -> Result<&mut Track, SplicerError> {
        self.selected_track = Some(name.to_string());
        self.track_or_create(name)
    }

    #[must_use]
    pub fn selected_track(&self) -> Option<&Track> {
        self.selected_track
            .as_deref()
            .and_then(|name| self.tracks.get(name))
    }

    #[must_use]
    pub fn take_path(&self, track: &Track, take: u32) -> PathBuf {
        self.directory.join(track.take_file_name(take))
    }

    /// Advances takes on every track that was actually recording. Returns the advanced names.
    /// Either every armed track advances or none does.
    #[instrument(skip(self), fields(session = %self.name))]
    pub fn complete_takes(&mut self, record_enabled: bool) -> Result<Vec<String>, SplicerError> {
        if !record_enabled {
            return Ok(Vec::new());
        }
        for track in self.tracks.values().filter(|track| track.record) {
            track.following_take()?;
        }

        let mut advanced = Vec::new();
        for track in self.tracks.values_mut().filter(|track| track.record) {
            track.complete_take()?;
            debug!(track = %track.name, take = track.selected_take, "take completed");
            advanced.push(track.name.clone());
        }
        if !advanced.is_empty() {
            self.touch();
        }
        Ok(advanced)
    }

    pub fn save(&self) -> Result<PathBuf, SplicerError> {
        let path = self.directory.join(SESSION_FILE_NAME);
        persistence::save_session(&path, self)?;
        Ok(path)
    }
}

/// Names double as file and directory names.
fn validate_name(kind: &str, name: &str) -> Result<(), SplicerError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|character| matches!(character, '/' | '\\' | '\0') || character.is_control());
    if invalid {
        return Err(SplicerError::configuration(format!(
            "invalid {kind} name: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_are_created_on_first_reference() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        session.track_or_create("vox").expect("track is created");
        session.track_or_create("vox").expect("track is reused");
        assert_eq!(session.tracks().count(), 1);
        assert_eq!(session.track("vox").map(|track| track.next_take), Some(1));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(Track::new("a/b").is_err());
        assert!(Track::new("").is_err());
        assert!(Track::new("..").is_err());
        assert!(Track::new("lead vox").is_ok());
    }

    #[test]
    fn removing_a_track_clears_the_selection() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        session.select_track("bass").expect("track is selected");
        assert!(session.remove_track("bass"));
        assert!(session.selected_track().is_none());
        assert!(!session.remove_track("bass"));
    }

    #[test]
    fn take_paths_live_in_the_session_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        let track = session.track_or_create("vox").expect("track").clone();
        assert_eq!(
            session.take_path(&track, 3),
            temp.path().join("gig").join("vox.take-3.wav")
        );
    }

    #[test]
    fn file_in_place_of_session_directory_is_a_conflict() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        std::fs::write(temp.path().join("gig"), "not a dir").expect("file should be writable");
        let err = Session::open_or_create(temp.path(), "gig").expect_err("conflict expected");
        assert!(matches!(err, SplicerError::Configuration(_)));
    }

    #[test]
    fn saved_sessions_reopen_with_their_takes() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        session.track_or_create("vox").expect("track").record = true;
        session.complete_takes(true).expect("takes advance");
        session.save().expect("session saves");

        let reopened = Session::open_or_create(temp.path(), "gig").expect("session reopens");
        let track = reopened.track("vox").expect("track persisted");
        assert_eq!(track.selected_take, 1);
        assert_eq!(track.next_take, 2);
        assert!(!track.dirty);
        assert_eq!(reopened.directory(), temp.path().join("gig"));
    }

    #[test]
    fn takes_advance_only_on_cycles_that_recorded() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        session.track_or_create("vox").expect("track").record = true;
        session.track_or_create("gtr").expect("track");

        let cycles = [true, false, true, true, false];
        let mut last_recorded = 0;
        for (cycle, record_enabled) in cycles.into_iter().enumerate() {
            let advanced = session
                .complete_takes(record_enabled)
                .expect("takes advance");
            if record_enabled {
                assert_eq!(advanced, vec!["vox".to_string()], "cycle {cycle}");
                last_recorded = session.track("vox").map_or(0, |track| track.selected_take);
            } else {
                assert!(advanced.is_empty(), "cycle {cycle}");
            }
        }

        let vox = session.track("vox").expect("vox exists");
        assert_eq!(vox.next_take, 1 + 3);
        assert_eq!(vox.selected_take, 3);
        assert_eq!(last_recorded, 3);
        assert!(vox.dirty);
        let gtr = session.track("gtr").expect("gtr exists");
        assert_eq!((gtr.selected_take, gtr.next_take), (0, 1));
    }

    fn tamper(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(path).expect("session file reads"))
                .expect("session file is json");
        edit(&mut value);
        fs::write(path, serde_json::to_vec(&value).expect("json serializes"))
            .expect("session file writes");
    }

    fn saved_gig(root: &Path) -> PathBuf {
        let mut session = Session::open_or_create(root, "gig").expect("session opens");
        session.track_or_create("vox").expect("track");
        session.save().expect("session saves")
    }

    #[test]
    fn loaded_track_names_cannot_leave_the_session_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = saved_gig(temp.path());
        tamper(&path, |value| {
            value["tracks"]["vox"]["name"] = "../../escape".into();
        });

        let err = Session::open_or_create(temp.path(), "gig").expect_err("bad name rejected");
        assert!(matches!(err, SplicerError::Configuration(ref message) if message.contains("escape")));
    }

    #[test]
    fn loaded_tracks_must_match_their_key() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = saved_gig(temp.path());
        tamper(&path, |value| {
            value["tracks"]["vox"]["name"] = "gtr".into();
        });
        assert!(matches!(
            Session::open_or_create(temp.path(), "gig"),
            Err(SplicerError::Configuration(_))
        ));
    }

    #[test]
    fn loaded_take_counters_must_be_ordered() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = saved_gig(temp.path());

        tamper(&path, |value| value["tracks"]["vox"]["next_take"] = 0.into());
        assert!(Session::open_or_create(temp.path(), "gig").is_err());

        tamper(&path, |value| {
            value["tracks"]["vox"]["next_take"] = 2.into();
            value["tracks"]["vox"]["selected_take"] = 2.into();
        });
        assert!(Session::open_or_create(temp.path(), "gig").is_err());

        tamper(&path, |value| value["tracks"]["vox"]["selected_take"] = 1.into());
        let reopened = Session::open_or_create(temp.path(), "gig").expect("valid again");
        assert_eq!(reopened.track("vox").map(|track| track.selected_take), Some(1));
    }

    #[test]
    fn exhausted_take_numbers_leave_every_track_untouched() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "gig").expect("session opens");
        session.track_or_create("bass").expect("track").record = true;
        let vox = session.track_or_create("vox").expect("track");
        vox.record = true;
        vox.selected_take = u32::MAX - 1;
        vox.next_take = u32::MAX;

        let err = session.complete_takes(true).expect_err("no take after u32::MAX");
        assert!(matches!(err, SplicerError::Configuration(_)));
        let bass = session.track("bass").expect("bass exists");
        assert_eq!((bass.selected_take, bass.next_take), (0, 1));
        assert!(!bass.dirty);
        let vox = session.track("vox").expect("vox exists");
        assert_eq!(vox.next_take, u32::MAX);
    }
}
