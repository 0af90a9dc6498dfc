//! Helpers shared by the unit tests.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// A fresh, non-global recorder and the handle that renders it.
pub(crate) fn prometheus_recorder() -> (PrometheusRecorder, PrometheusHandle) {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

fn sample_lines(rendered: &str) -> impl Iterator<Item = &str> {
    rendered
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Value of the series `name` with exactly `labels` in rendered exposition
/// text, label order ignored.
pub(crate) fn counter_value(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
    let mut want: Vec<String> = labels
        .iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect();
    want.sort();

    sample_lines(rendered).find_map(|line| {
        let (series, value) = line.rsplit_once(' ')?;
        let (series_name, label_str) = match series.split_once('{') {
            Some((series_name, rest)) => (series_name, rest.strip_suffix('}')?),
            None => (series, ""),
        };
        if series_name != name {
            return None;
        }
        let mut have: Vec<String> = label_str
            .split(',')
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .collect();
        have.sort();
        if have != want {
            return None;
        }
        value.parse().ok()
    })
}

/// Whether any sample line's metric name starts with `prefix`.
pub(crate) fn has_series(rendered: &str, prefix: &str) -> bool {
    sample_lines(rendered).any(|line| line.starts_with(prefix))
}
