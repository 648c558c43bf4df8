// Crate test suite.

mod test_frame;
mod test_tag;
