mod common;
mod digest_tests;
mod gc_tests;
mod update_tests;
