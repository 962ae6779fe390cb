pub mod helpers;

mod tests_dump;
