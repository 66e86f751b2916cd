//! End-to-end behaviour of drivers built from feature lists, against the
//! counting mock transport.

use labdrive_core::error_recovery::RetryPolicy;
use labdrive_core::feature::{RegisterWidth, Tolerance};
use labdrive_core::mock::MockTransport;
use labdrive_core::{
    Capability, Domain, Driver, ErrorKind, Feature, InstrError, StandardStatus, Triggerable,
    Value,
};
use std::sync::Arc;
use std::time::Duration;

fn function_generator(mock: Arc<MockTransport>) -> Driver {
    Driver::builder("function_generator", mock)
        .capability(Capability::StandardStatus)
        .capability(Capability::Trigger)
        .feature(
            Feature::text("output_state")
                .doc("Output relay")
                .query("OUTP?")
                .assign("OUTP {value}")
                .domain(Domain::Bool)
                .build()
                .unwrap(),
        )
        .feature(
            Feature::text("shape")
                .query("FUNC?")
                .assign("FUNC {value}")
                .domain(Domain::enumeration([
                    ("sin", "SIN"),
                    ("square", "SQU"),
                    ("ramp", "RAMP"),
                    ("pulse", "PULS"),
                    ("noise", "NOIS"),
                    ("dc", "DC"),
                ]))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::text("frequency")
                .doc("Hz")
                .query("FREQ?")
                .assign("FREQ {value}")
                .domain(Domain::float(1e-6, 2e7))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::text("voltage")
                .doc("Vpp")
                .query("VOLT?")
                .assign("VOLT {value:.4}")
                .domain(Domain::float(0.01, 10.0))
                .tolerance(Tolerance::Absolute(5e-5))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::text("offset")
                .query("VOLT:OFFS?")
                .assign("VOLT:OFFS {value}")
                .domain(Domain::float(-5.0, 5.0))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::text("burst_count")
                .query("BURS:NCYC?")
                .assign("BURS:NCYC {value}")
                .domain(Domain::int(1, 50_000))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn motor_controller(mock: Arc<MockTransport>) -> Driver {
    Driver::builder("motor_controller", mock)
        .feature(
            Feature::register("mode", 0)
                .domain(Domain::enumeration([("open_loop", "0"), ("closed_loop", "1")]))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::register("set_point", 10)
                .domain(Domain::any_float())
                .signed(true)
                .decimals(2)
                .build()
                .unwrap(),
        )
        .feature(
            Feature::register("target_position", 20)
                .domain(Domain::signed(32))
                .width(RegisterWidth::Two)
                .signed(true)
                .gated_on("mode", "closed_loop")
                .build()
                .unwrap(),
        )
        .feature(
            Feature::register("measured_position", 30)
                .domain(Domain::signed(32))
                .width(RegisterWidth::Two)
                .signed(true)
                .input_register()
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn function_generator_round_trip() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock.clone());

    fg.feature("output_state").unwrap().set(true).await.unwrap();
    fg.feature("shape").unwrap().set("sin").await.unwrap();
    fg.feature("frequency").unwrap().set(1e4).await.unwrap();
    fg.feature("voltage").unwrap().set(3.0).await.unwrap();
    fg.feature("offset").unwrap().set(1.0).await.unwrap();

    assert_eq!(fg.get("output_state").await.unwrap(), Value::Bool(true));
    assert_eq!(fg.get("shape").await.unwrap(), Value::from("sin"));
    let tolerances = fg.tolerances();
    for (name, expected) in [("frequency", 1e4), ("voltage", 3.0), ("offset", 1.0)] {
        let got = fg.get(name).await.unwrap();
        assert!(
            tolerances[name].accepts(&Value::Float(expected), &got),
            "{name}: {got}"
        );
    }
    assert!(mock.log().contains(&"VOLT 3.0000".to_string()));
    assert!(mock.log().contains(&"FUNC SIN".to_string()));
}

#[tokio::test]
async fn every_domain_value_round_trips() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock);
    let samples: Vec<(&str, Vec<Value>)> = vec![
        ("output_state", vec![true.into(), false.into()]),
        (
            "shape",
            ["sin", "square", "ramp", "pulse", "noise", "dc"]
                .into_iter()
                .map(Value::from)
                .collect(),
        ),
        ("frequency", vec![1e-6.into(), 0.5.into(), 1234.5678.into(), 2e7.into()]),
        ("voltage", vec![0.01.into(), 2.5.into(), 9.9999.into(), 10.0.into()]),
        ("offset", vec![(-5.0).into(), 0.0.into(), 4.75.into()]),
        ("burst_count", vec![Value::Int(1), Value::Int(17), Value::Int(50_000)]),
    ];
    let tolerances = fg.tolerances();
    for (name, values) in samples {
        for v in values {
            fg.set(name, v.clone()).await.unwrap();
            let got = fg.get(name).await.unwrap();
            assert!(tolerances[name].accepts(&v, &got), "{name}: set {v}, got {got}");
        }
    }
}

#[tokio::test]
async fn out_of_domain_values_perform_no_io() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock.clone());
    let cases: Vec<(&str, Value)> = vec![
        ("frequency", Value::Float(3e7)),
        ("frequency", Value::Float(f64::INFINITY)),
        ("voltage", Value::Float(0.0)),
        ("offset", Value::from("one")),
        ("shape", Value::from("triangle")),
        ("output_state", Value::Int(1)),
        ("burst_count", Value::Int(0)),
        ("burst_count", Value::Float(2.5)),
        ("status_enable_register", Value::Int(256)),
    ];
    for (name, value) in cases {
        let err = fg.set(name, value).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Domain, "{name}: {err}");
    }
    assert_eq!(mock.io_count(), 0);
}

#[tokio::test]
async fn read_only_features_reject_assignment() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock.clone());
    for name in ["identification", "error_queue"] {
        let err = fg.set(name, Value::from("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Domain);
    }
    let motor = motor_controller(mock.clone());
    let err = motor
        .set("measured_position", Value::Int(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert_eq!(mock.io_count(), 0);
}

#[tokio::test]
async fn unknown_and_reserved_names() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock);
    assert_eq!(
        fg.get("nonexistent").await.unwrap_err().kind(),
        ErrorKind::Lookup
    );
    assert_eq!(
        fg.get("interface").await.unwrap_err().kind(),
        ErrorKind::Domain
    );
    assert_eq!(
        fg.set("interface", Value::Int(1)).await.unwrap_err().kind(),
        ErrorKind::Domain
    );
    assert!(fg.feature("nonexistent").is_err());
}

#[tokio::test]
async fn status_mixin() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock.clone());
    fg.clear_status().await.unwrap();
    let sre = fg.feature("status_enable_register").unwrap();
    sre.set(50).await.unwrap();
    assert_eq!(sre.get().await.unwrap(), Value::Int(50));
    assert_eq!(sre.cached(), Some(Value::Int(50)));
    let err = sre.set(550).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);

    mock.set_state("*IDN", "ACME,FG-1,1234,1.0");
    assert_eq!(fg.identification().await.unwrap(), "ACME,FG-1,1234,1.0");
    mock.script("SYST:ERR?", "-113,\"Undefined header\"");
    mock.set_state("SYST:ERR", "0,\"No error\"");
    assert_eq!(
        fg.drain_errors(10).await.unwrap(),
        vec!["-113,\"Undefined header\"".to_string()]
    );

    fg.trigger().await.unwrap();
    fg.reset_device().await.unwrap();
    let log = mock.log();
    assert!(log.contains(&"*CLS".to_string()));
    assert!(log.contains(&"*TRG".to_string()));
    assert!(log.contains(&"*RST".to_string()));
}

#[tokio::test]
async fn capability_is_required_for_mixin_calls() {
    let mock = Arc::new(MockTransport::opened());
    let bare = Driver::builder("bare", mock).build().unwrap();
    assert_eq!(bare.trigger().await.unwrap_err().kind(), ErrorKind::State);
    assert_eq!(bare.clear_status().await.unwrap_err().kind(), ErrorKind::State);
}

#[test]
fn name_collisions_are_rejected_at_build() {
    let mock = Arc::new(MockTransport::opened());
    let err = Driver::builder("clash", mock.clone())
        .capability(Capability::Trigger)
        .feature(Feature::text("trigger").action("TRIG:IMM").build().unwrap())
        .build()
        .unwrap_err();
    assert!(matches!(err, InstrError::DuplicateFeature(ref n) if n == "trigger"));

    let err = Driver::builder("reserved", mock)
        .feature(Feature::text("interface").query("X?").build().unwrap())
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
}

#[tokio::test]
async fn scaled_register_feature() {
    let mock = Arc::new(MockTransport::opened());
    let motor = motor_controller(mock.clone());
    motor.set("set_point", Value::Float(1.23)).await.unwrap();
    assert_eq!(mock.register(10), 123);

    mock.set_register(10, 123);
    assert_eq!(motor.get("set_point").await.unwrap(), Value::Float(1.23));

    mock.set_register(10, (-250i16) as u16);
    assert_eq!(motor.get("set_point").await.unwrap(), Value::Float(-2.5));
}

#[tokio::test]
async fn signed_32_registers() {
    let mock = Arc::new(MockTransport::opened());
    let motor = motor_controller(mock.clone());
    mock.set_register(0, 1);
    for v in [i32::MIN, -1, 0, 1, i32::MAX] {
        motor.set("target_position", Value::from(v)).await.unwrap();
        assert_eq!(
            motor.get("target_position").await.unwrap(),
            Value::Int(v as i64)
        );
    }
    mock.set_register(30, 0xFFFF);
    mock.set_register(31, 0xFFFE);
    assert_eq!(
        motor.get("measured_position").await.unwrap(),
        Value::Int(-2)
    );
}

#[tokio::test]
async fn mode_gated_feature() {
    let mock = Arc::new(MockTransport::opened());
    let motor = motor_controller(mock.clone());
    mock.set_register(0, 0);

    let err = motor.get("target_position").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    let err = motor
        .set("target_position", Value::Int(1000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(mock.register_writes(), 0);

    motor
        .set("mode", Value::from("closed_loop"))
        .await
        .unwrap();
    motor
        .set("target_position", Value::Int(1000))
        .await
        .unwrap();
    assert_eq!(mock.register(21), 1000);
}

#[tokio::test]
async fn register_overflow_is_rejected_before_guard_read() {
    let mock = Arc::new(MockTransport::opened());
    let stage = Driver::builder("stage", mock.clone())
        .feature(
            Feature::register("mode", 0)
                .domain(Domain::enumeration([("open_loop", "0"), ("closed_loop", "1")]))
                .build()
                .unwrap(),
        )
        .feature(
            Feature::register("velocity", 40)
                .domain(Domain::any_float())
                .signed(true)
                .decimals(2)
                .gated_on("mode", "closed_loop")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    mock.set_register(0, 1);
    let before = mock.io_count();

    // 400.00 scales to 40000, past the signed 16-bit register.
    let err = stage.set("velocity", Value::Float(400.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert_eq!(mock.io_count(), before);
    assert_eq!(mock.register_reads(), 0);

    stage.set("velocity", Value::Float(300.0)).await.unwrap();
    assert_eq!(mock.register(40), 30000);
}

#[tokio::test]
async fn verified_write_detects_disagreement() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock.clone());
    fg.set_checked("voltage", Value::Float(3.0)).await.unwrap();

    mock.script("VOLT?", "2.5");
    let err = fg
        .set_checked("voltage", Value::Float(3.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let err = fg
        .set_checked("reset_device", Value::Unit)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
}

#[tokio::test]
async fn closed_transport_is_a_state_error() {
    let mock = Arc::new(MockTransport::new());
    let fg = function_generator(mock.clone());
    assert_eq!(
        fg.get("frequency").await.unwrap_err().kind(),
        ErrorKind::State
    );
    fg.open().await.unwrap();
    fg.close().await.unwrap();
    fg.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_reopens_transport() {
    let mock = Arc::new(MockTransport::opened());
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff_delay: Duration::from_millis(20),
    };
    let fg = Driver::builder("fg", mock.clone())
        .retry(policy)
        .feature(
            Feature::text("frequency")
                .query("FREQ?")
                .assign("FREQ {value}")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    mock.set_state("FREQ", "50");

    mock.fail_next(2);
    assert_eq!(fg.get("frequency").await.unwrap(), Value::Float(50.0));
    assert_eq!(mock.opens(), 2);

    mock.fail_next(5);
    let err = fg.get("frequency").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn introspection() {
    let mock = Arc::new(MockTransport::opened());
    let fg = function_generator(mock);
    let names = fg.names();
    assert_eq!(names[0], "clear_status");
    assert!(names.contains(&"trigger"));
    assert_eq!(names.last(), Some(&"burst_count"));

    let info = fg.describe();
    let voltage = info.iter().find(|i| i.name == "voltage").unwrap();
    assert_eq!(voltage.doc, "Vpp");
    assert_eq!(voltage.tolerance, Tolerance::Absolute(5e-5));

    let tolerances = fg.tolerances();
    assert_eq!(tolerances["shape"], Tolerance::Exact);
    assert_eq!(tolerances["frequency"], Tolerance::Relative(1e-9));
    assert!(!tolerances.contains_key("identification"));
}
