//! Property tests for framing: frames survive arbitrary stream chunking.
