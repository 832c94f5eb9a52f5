mod tests_put_get;
mod tests_recovery;
