mod helpers;
mod merge_tests;
mod writer_tests;
