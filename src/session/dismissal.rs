//! Dismissal phrase matching

/// Phrases that end an active session
pub const DEFAULT_DISMISSAL_PHRASES: &[&str] = &[
    "okay thanks",
    "ok thanks",
    "thank you",
    "thanks",
    "that's all",
    "thats all",
    "all done",
    "done",
    "i don't need you",
    "don't need you",
    "go away",
    "dismiss",
    "dismissed",
    "stop listening",
    "never mind",
    "goodbye",
    "bye",
    "see you later",
];

/// Case-insensitive substring matcher over a phrase list
#[derive(Debug, Clone)]
pub struct DismissalMatcher {
    phrases: Vec<String>,
}

impl DismissalMatcher {
    /// Build a matcher; empty phrases are ignored
    #[must_use]
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    /// First phrase contained in `transcript`, if any
    #[must_use]
    pub fn find(&self, transcript: &str) -> Option<&str> {
        let lowered = transcript.to_lowercase();
        self.phrases
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Whether `transcript` contains a dismissal phrase
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        self.find(transcript).is_some()
    }
}

impl Default for DismissalMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DISMISSAL_PHRASES)
    }
}
