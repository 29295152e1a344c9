mod common;

use ash::vk;
use common::*;
use novade_frame_graph::{
    AttachmentLoad, PassDesc, PipelineDesc, RenderGraphError, ResourceUsage, ShaderStageDesc, TargetFormat,
};
use pretty_assertions::assert_eq;

#[test]
fn reading_unwritten_contents_fails_before_acquire() {
    let mut graph = sim_graph();
    let history = color_target(&mut graph, "history");
    let backbuffer = graph.backbuffer().unwrap();
    let resolve = fullscreen_pipeline(&mut graph, "resolve", 20, TargetFormat::Backbuffer, 1);
    let set = sampling_set(&mut graph, resolve, &[history]);
    graph
        .register_pass(blit_pass("resolve", &[history], backbuffer, resolve, set))
        .unwrap();

    match graph.run_frame() {
        Err(RenderGraphError::UninitializedRead { pass, resource }) => {
            assert_eq!(pass, "resolve");
            assert_eq!(resource, "history");
        }
        other => panic!("expected an uninitialized read, got {:?}", other),
    }
    assert_eq!(graph.backend().stats().acquires, 0);
    assert_eq!(graph.backend().stats().submissions, 0);
}

#[test]
fn opted_in_passes_may_read_unwritten_contents() {
    let mut graph = sim_graph();
    let history = color_target(&mut graph, "history");
    let backbuffer = graph.backbuffer().unwrap();
    let resolve = fullscreen_pipeline(&mut graph, "resolve", 20, TargetFormat::Backbuffer, 1);
    let set = sampling_set(&mut graph, resolve, &[history]);
    graph
        .register_pass(blit_pass("resolve", &[history], backbuffer, resolve, set).allow_uninitialized_reads())
        .unwrap();
    let report = graph.run_frame().unwrap();
    assert_eq!(report.passes_executed, vec!["resolve"]);
}

#[test]
fn optional_pass_with_a_broken_shader_is_left_out() {
    let mut graph = sim_graph();
    let backbuffer = graph.backbuffer().unwrap();
    graph.register_pass(clear_pass("clear", backbuffer)).unwrap();

    let registered = graph
        .register_optional_pass("bloom", |graph| {
            let pipeline = graph.build_pipeline(
                PipelineDesc::graphics("bloom")
                    .with_stage(ShaderStageDesc::vertex(spirv(30)))
                    .with_stage(ShaderStageDesc::fragment(vec![0xde, 0xad, 0xbe, 0xef]))
                    .with_color_target(TargetFormat::Backbuffer),
            )?;
            Ok(PassDesc::graphics("bloom")
                .write(backbuffer, ResourceUsage::color_attachment_write())
                .record(move |ctx| ctx.bind_pipeline(pipeline)))
        })
        .unwrap();
    assert!(!registered);
    assert_eq!(graph.pass_names(), vec!["clear"]);
    assert_eq!(graph.run_frame().unwrap().passes_executed, vec!["clear"]);
}

#[test]
fn optional_pass_with_valid_setup_is_registered() {
    let mut graph = sim_graph();
    let backbuffer = graph.backbuffer().unwrap();
    let registered = graph
        .register_optional_pass("clear", |_| Ok(clear_pass("clear", backbuffer)))
        .unwrap();
    assert!(registered);
    assert_eq!(graph.is_pass_enabled("clear"), Some(true));
}

#[test]
fn failing_pass_still_presents() {
    let mut graph = sim_graph();
    let backbuffer = graph.backbuffer().unwrap();
    graph
        .register_pass(
            PassDesc::graphics("broken")
                .write(backbuffer, ResourceUsage::color_attachment_write())
                .record(move |ctx| {
                    ctx.begin_rendering(&[(backbuffer, AttachmentLoad::DontCare)], None)?;
                    // No pipeline bound.
                    ctx.draw(3, 1)
                }),
        )
        .unwrap();

    match graph.run_frame() {
        Err(RenderGraphError::PassFailed { pass, source }) => {
            assert_eq!(pass, "broken");
            assert!(matches!(*source, RenderGraphError::InvalidPass { .. }));
        }
        other => panic!("expected a pass failure, got {:?}", other),
    }
    assert_eq!(graph.backend().stats().presents, 1);

    graph.set_pass_enabled("broken", false).unwrap();
    for _ in 0..4 {
        graph.run_frame().unwrap();
    }
    graph.backend().complete_all();
    assert_eq!(graph.backend().stats().presents, 5);
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

#[test]
fn hung_queue_ends_the_session() {
    let mut graph = sim_graph();
    register_chain(&mut graph);
    for _ in 0..3 {
        graph.run_frame().unwrap();
    }
    graph.backend().hang();

    let mut outcome = None;
    for _ in 0..graph.device().frames_in_flight() + 1 {
        if let Err(e) = graph.run_frame() {
            outcome = Some(e);
            break;
        }
    }
    let error = outcome.expect("a hung queue stops the frame loop");
    assert!(matches!(error, RenderGraphError::DeviceLost(_)), "got {:?}", error);
    assert!(error.is_fatal());
}

#[test]
fn lost_device_is_fatal() {
    let mut graph = sim_graph();
    let backbuffer = graph.backbuffer().unwrap();
    graph.register_pass(clear_pass("clear", backbuffer)).unwrap();
    graph.run_frame().unwrap();
    graph.backend().inject_device_lost();
    let error = graph.run_frame().unwrap_err();
    assert!(matches!(error, RenderGraphError::DeviceLost(_)));
    assert!(error.is_fatal());
}

#[test]
fn pipelines_must_match_their_targets() {
    let mut graph = sim_graph();
    let error = graph
        .build_pipeline(
            PipelineDesc::graphics("depth-only")
                .with_stage(ShaderStageDesc::vertex(spirv(40)))
                .with_depth_target(vk::Format::R8G8B8A8_UNORM),
        )
        .unwrap_err();
    assert!(matches!(error, RenderGraphError::InvalidPipelineState { .. }));
}
