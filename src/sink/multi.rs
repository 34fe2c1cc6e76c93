//! Fan-out to several sinks at once.

use super::{Sink, VoiceData};
use crate::id::UserId;

/// Writes every frame into each of its children.
#[derive(Default)]
pub struct MultiSink {
    children: Vec<Box<dyn Sink>>,
}

impl MultiSink {
    /// Builds a fan-out over the given sinks.
    #[must_use]
    pub fn new(children: Vec<Box<dyn Sink>>) -> Self {
        Self { children }
    }

    /// Adds a sink to the fan-out.
    pub fn add_destination(&mut self, dest: Box<dyn Sink>) {
        self.children.push(dest);
    }

    /// Removes and returns the child at `index`, if it exists.
    pub fn remove_destination(&mut self, index: usize) -> Option<Box<dyn Sink>> {
        (index < self.children.len()).then(|| self.children.remove(index))
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the fan-out is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl Sink for MultiSink {
    fn write(&mut self, user: Option<UserId>, data: &VoiceData) {
        for child in &mut self.children {
            child.write(user, data);
        }
    }

    fn cleanup(&mut self) {
        for child in &mut self.children {
            child.cleanup();
        }
    }

    fn for_each_child(&mut self, f: &mut dyn FnMut(&mut dyn Sink)) {
        for child in &mut self.children {
            f(child.as_mut());
        }
    }
}
