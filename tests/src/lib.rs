//! Integration tests for `hls-readahead` live under `tests/`.
