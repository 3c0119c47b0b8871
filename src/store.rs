//! Live project state shared between the engine, its video tasks and any
//! observer rendering partial progress.
//!
//! Readers must go through the store on every use instead of holding a
//! snapshot: fan-out video tasks keep writing scene fields while later stages
//! run. Locks are never held across an `.await`.
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::model::{Breakdown, Character, Scene};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProjectState {
    pub title: String,
    pub characters: Vec<Character>,
    pub scenes: Vec<Scene>,
    pub thumbnail_prompt: Option<String>,
    pub thumbnail_url: Option<String>,
    pub final_video_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectStore {
    inner: Arc<RwLock<ProjectState>>,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn state(&self) -> ProjectState {
        self.inner.read().clone()
    }

    /// Replace characters and scenes with a fresh breakdown. Scene indices are
    /// assigned here once and never renumbered.
    pub fn load_breakdown(&self, breakdown: &Breakdown) {
        let mut state = self.inner.write();
        state.title = breakdown.title.clone();
        state.thumbnail_prompt = breakdown.thumbnail_prompt.clone();
        state.thumbnail_url = None;
        state.final_video_url = None;
        state.characters = breakdown
            .characters
            .iter()
            .map(|c| Character {
                name: c.name.clone(),
                prompt: c.prompt.clone(),
                image_url: None,
                locked: false,
            })
            .collect();
        state.scenes = breakdown
            .scenes
            .iter()
            .enumerate()
            .map(|(index, s)| Scene {
                index,
                image_prompt: s.image_prompt.clone(),
                video_prompt: s.video_prompt.clone(),
                dialogue: s.dialogue.clone(),
                camera_angle: s.camera_angle.clone(),
                emotion: s.emotion.clone(),
                sound_effects: s.sound_effects.clone(),
                ..Default::default()
            })
            .collect();
    }

    pub fn title(&self) -> String {
        self.inner.read().title.clone()
    }

    pub fn thumbnail_prompt(&self) -> Option<String> {
        self.inner.read().thumbnail_prompt.clone()
    }

    pub fn characters(&self) -> Vec<Character> {
        self.inner.read().characters.clone()
    }

    pub fn character_count(&self) -> usize {
        self.inner.read().characters.len()
    }

    pub fn scene_count(&self) -> usize {
        self.inner.read().scenes.len()
    }

    pub fn scene(&self, index: usize) -> Option<Scene> {
        self.inner.read().scenes.get(index).cloned()
    }

    pub fn scenes(&self) -> Vec<Scene> {
        self.inner.read().scenes.clone()
    }

    /// Mutate one character in place; returns false if the index is unknown.
    pub fn update_character(&self, index: usize, f: impl FnOnce(&mut Character)) -> bool {
        match self.inner.write().characters.get_mut(index) {
            Some(character) => {
                f(character);
                true
            }
            None => false,
        }
    }

    /// Mutate one scene in place; returns false if the index is unknown.
    pub fn update_scene(&self, index: usize, f: impl FnOnce(&mut Scene)) -> bool {
        match self.inner.write().scenes.get_mut(index) {
            Some(scene) => {
                f(scene);
                true
            }
            None => false,
        }
    }

    pub fn set_thumbnail_url(&self, url: impl Into<String>) {
        self.inner.write().thumbnail_url = Some(url.into());
    }

    pub fn thumbnail_url(&self) -> Option<String> {
        self.inner.read().thumbnail_url.clone()
    }

    pub fn set_final_video_url(&self, url: impl Into<String>) {
        self.inner.write().final_video_url = Some(url.into());
    }

    pub fn final_video_url(&self) -> Option<String> {
        self.inner.read().final_video_url.clone()
    }

    /// Number of scenes whose video is present and verified.
    pub fn valid_scene_count(&self) -> usize {
        self.inner
            .read()
            .scenes
            .iter()
            .filter(|s| s.is_complete())
            .count()
    }
}
