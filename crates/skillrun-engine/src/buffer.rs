/// Provisional text of the turn in progress.
///
/// Chunks append in arrival order; the terminal `response:complete` replaces
/// the whole buffer with canonical content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamBuffer {
    text: String,
    chunks: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.chunks += 1;
    }

    pub fn replace(&mut self, canonical: impl Into<String>) {
        self.text = canonical.into();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chunks = 0;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Chunks received since the last clear.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
