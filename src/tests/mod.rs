#[cfg(test)]
mod archive_scenarios;
#[cfg(test)]
mod support;
