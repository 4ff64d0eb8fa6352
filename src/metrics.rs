use crate::{
    protocol::{alpha_numeric_id, numeric_firmware_version},
    types::{DataMetric, Metric, PublishFormat},
};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Measurement name shared by both line formats
pub const MEASUREMENT: &str = "miflora";

/// Turns a [`Metric`] into wire lines
///
/// All lines derived from one metric carry the same `timestamp`.
pub trait MetricFormatter: Send + Sync {
    /// Format `metric` as observed at `timestamp`
    fn format(&self, metric: &Metric, timestamp: SystemTime) -> Vec<String>;
}

/// Field name and formatted value of a data metric, in publishing order
fn data_fields(metric: &DataMetric) -> [(&'static str, String); 9] {
    [
        ("battery_level", metric.metadata.battery_level.to_string()),
        (
            "firmware_version",
            numeric_firmware_version(&metric.metadata.firmware_version).to_string(),
        ),
        ("temperature", format!("{:.1}", metric.sensor.temperature)),
        ("brightness", metric.sensor.brightness.to_string()),
        ("moisture", metric.sensor.moisture.to_string()),
        ("conductivity", metric.sensor.conductivity.to_string()),
        ("connect_time", format!("{:.2}", metric.connect_seconds)),
        ("readout_time", format!("{:.2}", metric.readout_seconds)),
        ("rssi", metric.rssi.to_string()),
    ]
}

fn since_epoch(timestamp: SystemTime) -> std::time::Duration {
    timestamp.duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// `<prefix>.miflora.<id>.<field> <value> <unix seconds>`, one line per field
#[derive(Debug, Clone)]
pub struct GraphiteFormatter {
    prefix: String,
}

impl GraphiteFormatter {
    /// Create a formatter that puts every path below `prefix`
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl MetricFormatter for GraphiteFormatter {
    fn format(&self, metric: &Metric, timestamp: SystemTime) -> Vec<String> {
        let seconds = since_epoch(timestamp).as_secs();
        let path = format!(
            "{}.{}.{}",
            self.prefix,
            MEASUREMENT,
            alpha_numeric_id(metric.peripheral_id())
        );

        match metric {
            Metric::Data(data) => data_fields(data)
                .into_iter()
                .map(|(field, value)| format!("{path}.{field} {value} {seconds}"))
                .collect(),
            Metric::Error(error) => vec![format!("{path}.failed {} {seconds}", error.failed)],
        }
    }
}

/// `miflora,id=<id> <field>=<value>,... <unix nanoseconds>`, one line per metric
#[derive(Debug, Clone, Copy, Default)]
pub struct InfluxFormatter;

impl MetricFormatter for InfluxFormatter {
    fn format(&self, metric: &Metric, timestamp: SystemTime) -> Vec<String> {
        let nanos = since_epoch(timestamp).as_nanos();
        let fields = match metric {
            Metric::Data(data) => data_fields(data)
                .iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect::<Vec<_>>()
                .join(","),
            Metric::Error(error) => format!("failed={}", error.failed),
        };

        vec![format!(
            "{},id={} {} {}",
            MEASUREMENT,
            alpha_numeric_id(metric.peripheral_id()),
            fields,
            nanos
        )]
    }
}

/// Pick the formatter for `format`
///
/// `prefix` is only used by Graphite; Influx carries the measurement name instead.
#[must_use]
pub fn formatter_for(format: PublishFormat, prefix: &str) -> Box<dyn MetricFormatter> {
    match format {
        PublishFormat::Graphite => Box::new(GraphiteFormatter::new(prefix)),
        PublishFormat::Influx => Box::new(InfluxFormatter),
    }
}

/// Formatter stage: turn metrics into lines until the metric channel closes
///
/// Lines are forwarded in order. Stops early if the line channel closes.
pub async fn run_formatter(
    mut metrics: mpsc::Receiver<Metric>,
    lines: mpsc::Sender<String>,
    formatter: Box<dyn MetricFormatter>,
) {
    while let Some(metric) = metrics.recv().await {
        let timestamp = SystemTime::now();

        for line in formatter.format(&metric, timestamp) {
            trace!("Formatted {}", line);
            if lines.send(line).await.is_err() {
                debug!("Line channel closed, stopping formatter");
                return;
            }
        }
    }

    debug!("Metric channel closed, formatter done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorMetric, SensorReading, VersionBattery};
    use std::time::Duration;

    fn data_metric() -> Metric {
        Metric::Data(DataMetric {
            peripheral_id: "C4:7C:8D:6A:12:34".to_string(),
            metadata: VersionBattery {
                battery_level: 100,
                firmware_version: "2.7.0".to_string(),
            },
            sensor: SensorReading {
                temperature: 24.2,
                brightness: 121,
                moisture: 16,
                conductivity: 101,
            },
            connect_seconds: 3.42,
            readout_seconds: 0.234,
            rssi: -77,
        })
    }

    fn error_metric() -> Metric {
        Metric::Error(ErrorMetric {
            peripheral_id: "peri".to_string(),
            failed: 1,
        })
    }

    fn timestamp() -> SystemTime {
        UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789)
    }

    #[test]
    fn test_graphite_data_metric() {
        let lines = GraphiteFormatter::new("foo.base").format(&data_metric(), timestamp());

        assert_eq!(
            lines,
            vec![
                "foo.base.miflora.c47c8d6a1234.battery_level 100 1700000000",
                "foo.base.miflora.c47c8d6a1234.firmware_version 20700 1700000000",
                "foo.base.miflora.c47c8d6a1234.temperature 24.2 1700000000",
                "foo.base.miflora.c47c8d6a1234.brightness 121 1700000000",
                "foo.base.miflora.c47c8d6a1234.moisture 16 1700000000",
                "foo.base.miflora.c47c8d6a1234.conductivity 101 1700000000",
                "foo.base.miflora.c47c8d6a1234.connect_time 3.42 1700000000",
                "foo.base.miflora.c47c8d6a1234.readout_time 0.23 1700000000",
                "foo.base.miflora.c47c8d6a1234.rssi -77 1700000000",
            ]
        );
    }

    #[test]
    fn test_graphite_error_metric() {
        let lines = GraphiteFormatter::new("foo.base").format(&error_metric(), timestamp());

        assert_eq!(lines, vec!["foo.base.miflora.peri.failed 1 1700000000"]);
    }

    #[test]
    fn test_influx_data_metric() {
        let lines = InfluxFormatter.format(&data_metric(), timestamp());

        assert_eq!(
            lines,
            vec![
                "miflora,id=c47c8d6a1234 battery_level=100,firmware_version=20700,temperature=24.2,\
                 brightness=121,moisture=16,conductivity=101,connect_time=3.42,readout_time=0.23,\
                 rssi=-77 1700000000123456789"
            ]
        );

        let parts: Vec<&str> = lines[0].split(' ').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].split(',').count(), 9);
        assert!(!parts[1].ends_with(','));
    }

    #[test]
    fn test_influx_error_metric() {
        let lines = InfluxFormatter.format(&error_metric(), timestamp());

        assert_eq!(lines, vec!["miflora,id=peri failed=1 1700000000123456789"]);
    }

    #[test]
    fn test_formatter_selection() {
        let graphite = formatter_for(PublishFormat::Graphite, "sensors");
        assert_eq!(graphite.format(&data_metric(), timestamp()).len(), 9);

        let influx = formatter_for(PublishFormat::Influx, "sensors");
        assert_eq!(influx.format(&data_metric(), timestamp()).len(), 1);
    }

    #[tokio::test]
    async fn test_formatter_stage_forwards_lines_in_order() {
        let (metric_tx, metric_rx) = mpsc::channel(1);
        let (line_tx, mut line_rx) = mpsc::channel(10);
        let stage = tokio::spawn(run_formatter(
            metric_rx,
            line_tx,
            formatter_for(PublishFormat::Graphite, "sensors"),
        ));

        metric_tx.send(error_metric()).await.unwrap();
        metric_tx.send(data_metric()).await.unwrap();
        drop(metric_tx);

        let mut lines = Vec::new();
        while let Some(line) = line_rx.recv().await {
            lines.push(line);
        }
        stage.await.unwrap();

        assert_eq!(lines.len(), 10);
        assert!(lines[0].starts_with("sensors.miflora.peri.failed 1 "));
        assert!(lines[1].starts_with("sensors.miflora.c47c8d6a1234.battery_level 100 "));
        assert!(lines[9].starts_with("sensors.miflora.c47c8d6a1234.rssi -77 "));

        let timestamps: Vec<&str> = lines[1..]
            .iter()
            .filter_map(|line| line.rsplit(' ').next())
            .collect();
        assert!(timestamps.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
