use influx_sink::{to_line_protocol, InfluxWriter, PublishError};
use types::{MetricValue, Point};

#[test]
fn float_point_renders_measurement_tag_and_field() {
    let point = Point::new("PV_Power")
        .tag("sensor", "123456")
        .field("value", MetricValue::Float(1480.5))
        .timestamp_ms(1_700_000_000_000);

    let line = to_line_protocol(&point).expect("encode");
    assert_eq!(line, "PV_Power,sensor=123456 value=1480.5 1700000000000");
}

#[test]
fn text_point_quotes_and_escapes_the_value() {
    let point = Point::new("Inverter_Status")
        .tag("sensor", "123456")
        .field("value", MetricValue::Text("Run \"ok\"".to_string()));

    let line = to_line_protocol(&point).expect("encode");
    assert_eq!(
        line,
        "Inverter_Status,sensor=123456 value=\"Run \\\"ok\\\"\""
    );
}

#[test]
fn special_characters_in_names_are_escaped() {
    let point = Point::new("grid voltage,rms")
        .tag("sensor id", "a=b")
        .field("value", MetricValue::Float(230.0));

    let line = to_line_protocol(&point).expect("encode");
    assert_eq!(
        line,
        "grid\\ voltage\\,rms,sensor\\ id=a\\=b value=230"
    );
}

#[test]
fn point_without_fields_is_rejected() {
    let point = Point::new("PV_Power").tag("sensor", "123456");
    assert!(matches!(
        to_line_protocol(&point),
        Err(PublishError::Encode(_))
    ));
}

#[test]
fn point_without_timestamp_omits_the_trailer() {
    let point = Point::new("PV_Power").field("value", MetricValue::Float(0.0));
    let line = to_line_protocol(&point).expect("encode");
    assert_eq!(line, "PV_Power value=0");
}

#[tokio::test]
async fn mock_writer_accepts_points() {
    let writer = InfluxWriter::new_mock("mydb");
    let point = Point::new("PV_Power")
        .tag("sensor", "123456")
        .field("value", MetricValue::Float(42.0));

    writer.write_point(&point).await.expect("mock write");
    assert_eq!(writer.database(), "mydb");
}
