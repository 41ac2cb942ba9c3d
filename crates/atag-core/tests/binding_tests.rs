//! Binding tests for Detector against scripted modules

use atag_core::signature::{FrameRole, OptionRole};
use atag_core::{
    Catalogs, ConfigureSignature, Detector, DetectorConfig, Error, FrameSignature, Mismatch,
    ModuleScript, Operation, ScriptedModule, Signature, Value,
};
use pretty_assertions::assert_eq;

const THREADS_ONLY: ConfigureSignature = Signature::new("n", &[OptionRole::Threads]);
const THREADS_AND_DECIMATE: ConfigureSignature =
    Signature::new("n,qd", &[OptionRole::Threads, OptionRole::QuadDecimate]);
const NO_ARGS: FrameSignature = Signature::new("none", &[]);
const PTR_W_H: FrameSignature = Signature::new(
    "ptr,w,h",
    &[FrameRole::Pointer, FrameRole::Width, FrameRole::Height],
);
const W_H: FrameSignature = Signature::new("w,h", &[FrameRole::Width, FrameRole::Height]);

/// Helper: a module that only answers detect with three arguments
fn three_arg_script() -> ModuleScript {
    ModuleScript {
        detect_arities: vec![3],
        on_mismatch: Mismatch::Return(-1),
        ..ModuleScript::default()
    }
}

fn create(script: ModuleScript) -> atag_core::Result<Detector<ScriptedModule>> {
    Detector::create(ScriptedModule::new(script), DetectorConfig::default())
}

#[test]
fn test_missing_mandatory_export_names_operation() {
    for operation in Operation::ALL.into_iter().filter(|op| op.is_mandatory()) {
        let script = ModuleScript::default().without(operation);
        match create(script) {
            Err(Error::Resolution {
                operation: missing, ..
            }) => assert_eq!(missing, operation),
            Err(other) => panic!("{}: expected resolution error, got {}", operation, other),
            Ok(_) => panic!("{}: construction should fail", operation),
        }
    }
}

#[test]
fn test_resolution_error_mentions_operation() {
    let err = create(ModuleScript::default().without(Operation::SetImageBuffer))
        .err()
        .unwrap();
    assert!(err.to_string().contains("setImageBuffer"));
}

#[test]
fn test_probe_selects_only_ptr_w_h() {
    let detector = create(three_arg_script()).unwrap();
    let binding = detector.chosen_binding();
    assert_eq!(binding.configure_label(), "n");
    assert_eq!(binding.detect.label(), "ptr,w,h");

    let accepted: Vec<_> = detector
        .probe_log()
        .pairs()
        .filter(|a| a.outcome.is_accepted())
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].detect, Some("ptr,w,h"));

    let module = detector.module();
    assert_eq!(module.allocations(), module.releases());
    assert_eq!(module.outstanding(), 0);
}

#[test]
fn test_probe_succeeds_when_every_configure_traps() {
    let script = ModuleScript {
        failing_exports: vec!["_atagjs_set_detector_options".to_string()],
        ..three_arg_script()
    };
    let detector = create(script).unwrap();
    assert_eq!(detector.chosen_binding().configure, None);
    assert_eq!(detector.chosen_binding().configure_label(), "(none)");
    assert_eq!(detector.chosen_binding().detect.label(), "ptr,w,h");
}

#[test]
fn test_probe_without_configure_export() {
    let script = ModuleScript::default().without(Operation::ConfigureOptions);
    let mut detector = create(script).unwrap();
    assert_eq!(detector.chosen_binding().configure, None);

    detector.detect(&[0; 16], 4, 4).unwrap();
    assert_eq!(detector.module().call_count(Operation::ConfigureOptions), 0);
}

#[test]
fn test_repeated_detect_does_not_grow_outstanding_regions() {
    let mut detector = create(three_arg_script()).unwrap();
    let image = vec![7u8; 32 * 24];

    let first = detector.detect(&image, 32, 24).unwrap();
    let after_first = (detector.module().allocations(), detector.module().releases());
    let second = detector.detect(&image, 32, 24).unwrap();
    let after_second = (detector.module().allocations(), detector.module().releases());

    assert_eq!(first.count, second.count);
    assert_eq!(first.raw_return, second.raw_return);
    assert_eq!(first.binding, second.binding);
    assert_eq!(after_second.0 - after_first.0, 1);
    assert_eq!(after_second.1 - after_first.1, 1);
    assert_eq!(detector.module().outstanding(), 0);
}

#[test]
fn test_catalog_order_breaks_ties() {
    let catalogs = Catalogs::new(vec![THREADS_ONLY, THREADS_AND_DECIMATE], vec![PTR_W_H, W_H]);
    let script = ModuleScript {
        configure_arities: vec![1, 2],
        ..three_arg_script()
    };
    let detector = Detector::with_catalogs(
        ScriptedModule::new(script.clone()),
        DetectorConfig::default(),
        &catalogs,
    )
    .unwrap();
    assert_eq!(detector.chosen_binding().configure, Some(THREADS_ONLY));
    assert_eq!(detector.chosen_binding().detect, PTR_W_H);

    // Reversed catalog, reversed choice.
    let reversed = Catalogs::new(vec![THREADS_AND_DECIMATE, THREADS_ONLY], vec![PTR_W_H, W_H]);
    let detector =
        Detector::with_catalogs(ScriptedModule::new(script), DetectorConfig::default(), &reversed)
            .unwrap();
    assert_eq!(detector.chosen_binding().configure, Some(THREADS_AND_DECIMATE));
}

#[test]
fn test_detect_fault_does_not_leak_or_poison() {
    let mut detector = create(three_arg_script()).unwrap();
    let image = vec![0u8; 64];

    detector.module_mut().fail_next_detects(1);
    let err = detector.detect(&image, 8, 8).unwrap_err();
    assert!(matches!(err, Error::Call { export: "_atagjs_detect", .. }));
    assert!(err.is_frame_scoped());
    assert_eq!(detector.module().outstanding(), 0);

    let result = detector.detect(&image, 8, 8).unwrap();
    assert_eq!(result.raw_return, Some(Value::I32(0)));
    assert_eq!(result.frame, 2);
    assert_eq!(detector.module().outstanding(), 0);
}

#[test]
fn test_end_to_end_minimal_catalogs() {
    let catalogs = Catalogs::new(vec![THREADS_ONLY], vec![NO_ARGS, PTR_W_H]);
    let detector =
        Detector::with_catalogs(ScriptedModule::new(three_arg_script()), DetectorConfig::default(), &catalogs)
            .unwrap();
    let binding = detector.chosen_binding();
    assert_eq!(binding.configure_label(), "n");
    assert_eq!(binding.detect.label(), "ptr,w,h");
    assert_eq!(binding.to_string(), "configure=n detect=ptr,w,h image=ptr,w,h");

    let outcomes: Vec<String> = detector
        .probe_log()
        .attempts()
        .iter()
        .map(|a| a.to_string())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            "detect none after configure n -> ret=-1",
            "detect ptr,w,h after configure n -> ret=0",
        ]
    );
}

#[test]
fn test_exhaustion_is_fatal_and_logged() {
    let script = ModuleScript {
        configure_arities: vec![1, 5, 6],
        detect_arities: vec![],
        ..ModuleScript::default()
    };
    match create(script) {
        Err(Error::ProbeExhausted { log }) => {
            assert_eq!(log.pairs().count(), 8 * 5);
            let rendered = log.to_string();
            assert!(rendered.contains("detect w,h,ptr after configure qd,qs,re,ds,0,n"));
        }
        Err(other) => panic!("expected exhaustion, got {}", other),
        Ok(_) => panic!("construction should fail"),
    }
}

#[test]
fn test_probe_allocation_failure_is_fatal() {
    let script = ModuleScript {
        fail_allocations: true,
        ..ModuleScript::default()
    };
    assert!(matches!(create(script), Err(Error::Allocation { len: 4096, .. })));
}

#[test]
fn test_frame_allocation_failure_keeps_detector() {
    let mut detector = create(ModuleScript::default()).unwrap();
    detector.module_mut().script_mut().fail_allocations = true;
    let err = detector.detect(&[0; 4], 2, 2).unwrap_err();
    assert!(matches!(err, Error::Allocation { .. }));

    detector.module_mut().script_mut().fail_allocations = false;
    assert!(detector.detect(&[0; 4], 2, 2).is_ok());
}

#[test]
fn test_frame_larger_than_memory() {
    let script = ModuleScript {
        memory_bytes: 8 * 1024,
        ..ModuleScript::default()
    };
    let mut detector = create(script).unwrap();
    let big = vec![0u8; 128 * 128];
    assert!(matches!(
        detector.detect(&big, 128, 128),
        Err(Error::Allocation { .. })
    ));
    assert_eq!(detector.module().outstanding(), 0);
}

#[test]
fn test_detectors_are_independent() {
    let strict = create(three_arg_script()).unwrap();
    let lenient = create(ModuleScript {
        detect_arities: vec![0],
        ..ModuleScript::default()
    })
    .unwrap();
    assert_eq!(strict.chosen_binding().detect.label(), "ptr,w,h");
    assert_eq!(lenient.chosen_binding().detect.label(), "none");
}

#[test]
fn test_detection_count_from_module() {
    let mut detector = create(ModuleScript {
        detect_returns: 3,
        ..three_arg_script()
    })
    .unwrap();
    let result = detector.detect(&[0; 9], 3, 3).unwrap();
    assert_eq!(result.count, 3);
}

#[test]
fn test_detect_frame_converts_rgba() {
    let mut detector = create(ModuleScript::default()).unwrap();
    let rgba = [30u8, 60, 90, 255, 0, 0, 0, 255];
    detector
        .detect_frame(&rgba, 2, 1, atag_core::FrameFormat::Rgba8)
        .unwrap();
    let (pointer, width, height) = detector.module().bound_image().unwrap();
    assert_eq!((width, height), (2, 1));
    assert_eq!(detector.module().read(pointer, 2), Some(&[60u8, 0][..]));
}

#[test]
fn test_detect_image() {
    let mut detector = create(ModuleScript::default()).unwrap();
    let image = image::GrayImage::from_pixel(5, 4, image::Luma([128]));
    let result = detector.detect_image(&image).unwrap();
    assert_eq!(result.count, 0);
    assert_eq!(detector.module().bound_image().map(|b| (b.1, b.2)), Some((5, 4)));
}

#[test]
fn test_binding_json() {
    let detector = create(three_arg_script()).unwrap();
    let json = serde_json::to_value(detector.chosen_binding()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "configure": "n",
            "detect": "ptr,w,h",
            "image": "ptr,w,h"
        })
    );
}

#[test]
fn test_detect_frame_rejects_oversized_dimensions() {
    let mut detector = create(ModuleScript::default()).unwrap();
    let before = detector.module().call_count(Operation::Allocate);
    let err = detector
        .detect_frame(&[], u32::MAX, u32::MAX, atag_core::FrameFormat::Rgba8)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFrame(_)));
    assert_eq!(detector.module().call_count(Operation::Allocate), before);
    assert!(detector.detect(&[0; 4], 2, 2).is_ok());
}
