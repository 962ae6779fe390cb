mod tests_deferred;
mod tests_merge;
