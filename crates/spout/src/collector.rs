//! Folding a sequence of chunks into one final value.

use crate::Chunk;

/// Accumulates output chunks into a final container.
pub trait Collector<T> {
    type Output;

    fn add(&mut self, chunk: &Chunk<T>);

    fn result(self) -> Self::Output;
}

/// Collects elements into a `Vec`.
pub struct VecCollector<T>(Vec<T>);

impl<T> Default for VecCollector<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Clone> Collector<T> for VecCollector<T> {
    type Output = Vec<T>;

    fn add(&mut self, chunk: &Chunk<T>) {
        self.0.extend_from_slice(chunk);
    }

    fn result(self) -> Vec<T> {
        self.0
    }
}

/// Collects bytes into a `Vec<u8>`.
#[derive(Default)]
pub struct BytesCollector(Vec<u8>);

impl BytesCollector {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }
}

impl Collector<u8> for BytesCollector {
    type Output = Vec<u8>;

    fn add(&mut self, chunk: &Chunk<u8>) {
        self.0.extend_from_slice(chunk);
    }

    fn result(self) -> Vec<u8> {
        self.0
    }
}

/// Concatenates string elements.
#[derive(Default)]
pub struct StringCollector(String);

impl Collector<String> for StringCollector {
    type Output = String;

    fn add(&mut self, chunk: &Chunk<String>) {
        for s in chunk {
            self.0.push_str(s);
        }
    }

    fn result(self) -> String {
        self.0
    }
}

/// Collects all elements into a single chunk.
pub struct ChunkCollector<T>(Vec<Chunk<T>>);

impl<T> Default for ChunkCollector<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Clone> Collector<T> for ChunkCollector<T> {
    type Output = Chunk<T>;

    fn add(&mut self, chunk: &Chunk<T>) {
        if !chunk.is_empty() {
            self.0.push(chunk.clone());
        }
    }

    fn result(mut self) -> Chunk<T> {
        match self.0.len() {
            0 => Chunk::empty(),
            1 => self.0.remove(0),
            _ => Chunk::concat(&self.0),
        }
    }
}
