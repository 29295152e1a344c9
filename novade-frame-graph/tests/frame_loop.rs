mod common;

use ash::vk;
use ash::vk::Handle;
use common::*;
use novade_frame_graph::backend::sim::{Command, ExecutedCommand, SimConfig};
use novade_frame_graph::backend::SamplerInfo;
use novade_frame_graph::barrier::{BarrierTarget, ResolvedBarrier};
use novade_frame_graph::{FrameGraphConfig, ImageDesc, ImageSize, QueueKind, TargetFormat};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::HashMap;

#[test]
fn hundred_frames_keep_cross_queue_order() {
    let mut graph = sim_graph();
    register_chain(&mut graph);

    for expected in 1..=100u64 {
        let report = graph.run_frame().unwrap();
        assert_eq!(report.frame_number, expected);
        assert_eq!(report.passes_executed, vec!["A", "B", "C"]);
        // A | B | C on graphics, compute, graphics.
        assert_eq!(report.batches, 3);
    }
    graph.backend().complete_all();

    let expected: Vec<String> = (0..100)
        .flat_map(|_| ["A", "B", "C"])
        .map(String::from)
        .collect();
    assert_eq!(label_names(&graph), expected);
    let compute_labels: Vec<String> = graph
        .backend()
        .executed_labels()
        .into_iter()
        .filter(|label| label.queue == QueueKind::Compute)
        .map(|label| label.name)
        .collect();
    assert!(compute_labels.iter().all(|name| name == "B"));
    assert_eq!(compute_labels.len(), 100);

    let stats = graph.backend().stats();
    assert_eq!(stats.presents, 100);
    assert_eq!(stats.dispatches, 100);
    assert_eq!(stats.draws, 100);
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

fn label_positions(log: &[ExecutedCommand], name: &str) -> Vec<usize> {
    log.iter()
        .enumerate()
        .filter(|(_, executed)| matches!(&executed.command, Command::BeginLabel(label) if label == name))
        .map(|(i, _)| i)
        .collect()
}

/// Barriers on `raw` executed strictly between positions `from` and `to`.
fn barriers_between(log: &[ExecutedCommand], from: usize, to: usize, raw: u64) -> Vec<(QueueKind, ResolvedBarrier)> {
    log[from + 1..to]
        .iter()
        .flat_map(|executed| match &executed.command {
            Command::Barrier(barriers) => barriers.iter().map(|b| (executed.queue, *b)).collect::<Vec<_>>(),
            _ => Vec::new(),
        })
        .filter(|(_, barrier)| target_raw(barrier) == raw)
        .collect()
}

fn target_raw(barrier: &ResolvedBarrier) -> u64 {
    match barrier.target {
        BarrierTarget::Image { image, .. } => image.as_raw(),
        BarrierTarget::Buffer(buffer) => buffer.as_raw(),
    }
}

#[test]
fn dependent_passes_are_separated_by_barriers_in_the_command_stream() {
    let mut graph = sim_graph();
    let chain = register_chain(&mut graph);
    let frames = 5;
    for _ in 0..frames {
        graph.run_frame().unwrap();
    }
    graph.backend().complete_all();

    let scene = graph.device().arena().image(chain.scene).unwrap().raw().as_raw();
    let particles = graph.device().arena().buffer(chain.particles).unwrap().raw().as_raw();
    let log = graph.backend().executed_commands();
    let (a, b, c) = (label_positions(&log, "A"), label_positions(&log, "B"), label_positions(&log, "C"));
    assert_eq!((a.len(), b.len(), c.len()), (frames, frames, frames));

    for frame in 0..frames {
        assert!(a[frame] < b[frame] && b[frame] < c[frame], "frame {} out of order", frame);
        if frame + 1 < frames {
            assert!(c[frame] < a[frame + 1]);
        }

        // A's color write is released by graphics and made visible to B's sampling.
        let scene_barriers = barriers_between(&log, a[frame], b[frame], scene);
        assert!(scene_barriers.iter().any(|(queue, barrier)| *queue == QueueKind::Graphics
            && barrier.src.access.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            && barrier.old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            && barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        assert!(scene_barriers.iter().any(|(queue, barrier)| *queue == QueueKind::Compute
            && barrier.dst.stages.contains(vk::PipelineStageFlags::COMPUTE_SHADER)
            && barrier.dst.access.contains(vk::AccessFlags::SHADER_READ)
            && barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));

        // B's storage write reaches C's vertex input.
        let particle_barriers = barriers_between(&log, b[frame], c[frame], particles);
        assert!(particle_barriers.iter().any(|(queue, barrier)| *queue == QueueKind::Compute
            && barrier.src.access.contains(vk::AccessFlags::SHADER_WRITE)));
        assert!(particle_barriers.iter().any(|(queue, barrier)| *queue == QueueKind::Graphics
            && barrier.dst.stages.contains(vk::PipelineStageFlags::VERTEX_INPUT)
            && barrier.dst.access.contains(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)));
    }
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
fn slots_are_reused_only_after_their_fence(#[case] frames_in_flight: u32) {
    let mut config = FrameGraphConfig::default();
    config.renderer.frames_in_flight = frames_in_flight;
    let mut graph = sim_graph_with(SimConfig::default(), config);
    register_chain(&mut graph);

    for _ in 0..12 {
        let report = graph.run_frame().unwrap();
        let n = report.frame_number;
        assert_eq!(report.slot as u64, (n - 1) % u64::from(frames_in_flight));
        // Acquiring frame n reclaimed the slot of frame n - frames_in_flight.
        assert!(graph.device().scheduler().last_completed_frame() >= n.saturating_sub(u64::from(frames_in_flight)));
        assert_eq!(graph.device().scheduler().frame_number(report.slot), Some(n));
    }
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

#[test]
fn reads_of_the_same_state_share_one_transition() {
    let mut graph = sim_graph();
    let texture = graph
        .create_image(
            ImageDesc::new(
                "lut",
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
                ImageSize::Absolute { width: 32, height: 32 },
            )
            .with_contents(vec![0x7f; 32 * 32 * 4])
            .with_sampler(SamplerInfo::default()),
        )
        .unwrap();
    let intermediate = color_target(&mut graph, "graded");
    let backbuffer = graph.backbuffer().unwrap();
    let hdr = TargetFormat::Format(vk::Format::R16G16B16A16_SFLOAT);
    let grade = fullscreen_pipeline(&mut graph, "grade", 3000, hdr, 1);
    let grade_set = sampling_set(&mut graph, grade, &[texture]);
    let overlay = fullscreen_pipeline(&mut graph, "overlay", 3001, TargetFormat::Backbuffer, 1);
    let overlay_set = sampling_set(&mut graph, overlay, &[texture]);
    graph
        .register_pass(blit_pass("grade", &[texture], intermediate, grade, grade_set))
        .unwrap();
    graph
        .register_pass(blit_pass("overlay", &[texture], backbuffer, overlay, overlay_set))
        .unwrap();

    let raw = graph.device().arena().image(texture).unwrap().raw();
    let texture_barriers = |graph: &SimGraph| {
        graph
            .backend()
            .executed_barriers()
            .into_iter()
            .filter(|(_, b)| matches!(b.target, BarrierTarget::Image { image, .. } if image == raw))
            .map(|(_, b)| (b.old_layout, b.new_layout))
            .collect::<Vec<_>>()
    };

    graph.run_frame().unwrap();
    graph.backend().complete_all();
    assert_eq!(
        texture_barriers(&graph),
        vec![
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        ]
    );

    graph.backend().clear_logs();
    graph.run_frame().unwrap();
    graph.backend().complete_all();
    assert!(texture_barriers(&graph).is_empty());
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

#[test]
fn cross_family_transfers_are_paired() {
    let mut graph = sim_graph();
    let chain = register_chain(&mut graph);
    let families = graph.device().families();
    assert_eq!((families.graphics, families.compute), (0, 1));

    for _ in 0..3 {
        graph.run_frame().unwrap();
    }
    graph.backend().complete_all();

    // (resource, src family, dst family) -> (releases, acquires)
    let mut transfers: HashMap<(u64, u32, u32), (usize, usize)> = HashMap::new();
    for (queue, barrier) in graph.backend().executed_barriers() {
        if barrier.src_queue_family == barrier.dst_queue_family
            || barrier.src_queue_family == vk::QUEUE_FAMILY_IGNORED
        {
            continue;
        }
        let entry = transfers
            .entry((target_raw(&barrier), barrier.src_queue_family, barrier.dst_queue_family))
            .or_default();
        let family = families.family(queue);
        if family == barrier.src_queue_family {
            entry.0 += 1;
        } else if family == barrier.dst_queue_family {
            entry.1 += 1;
        } else {
            panic!("transfer barrier executed on unrelated family {}", family);
        }
    }

    let scene = graph.device().arena().image(chain.scene).unwrap().raw().as_raw();
    let to_compute = transfers.get(&(scene, families.graphics, families.compute)).copied();
    assert_eq!(to_compute, Some((3, 3)));
    let particles = graph.device().arena().buffer(chain.particles).unwrap().raw().as_raw();
    let to_graphics = transfers.get(&(particles, families.compute, families.graphics)).copied();
    assert_eq!(to_graphics, Some((3, 3)));
    for ((_, src, dst), (releases, acquires)) in &transfers {
        assert_eq!(releases, acquires, "unpaired transfer {} -> {}", src, dst);
    }
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}

#[test]
fn single_family_devices_need_no_ownership_transfers() {
    let mut graph = sim_graph_with(
        SimConfig {
            single_queue_family: true,
            ..SimConfig::default()
        },
        FrameGraphConfig::default(),
    );
    register_chain(&mut graph);
    graph.run_frame().unwrap();
    graph.backend().complete_all();
    assert!(graph
        .backend()
        .executed_barriers()
        .iter()
        .all(|(_, b)| b.src_queue_family == b.dst_queue_family));
    assert_eq!(label_names(&graph), vec!["A", "B", "C"]);
}

#[test]
fn mip_chain_is_generated_once() {
    let mut graph = sim_graph();
    let texture = graph
        .create_image(
            ImageDesc::new(
                "albedo",
                vk::Format::R8G8B8A8_SRGB,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
                ImageSize::Absolute { width: 64, height: 64 },
            )
            .with_full_mip_chain()
            .with_contents(vec![0xff; 64 * 64 * 4])
            .with_sampler(SamplerInfo::default()),
        )
        .unwrap();
    assert_eq!(graph.device().arena().image(texture).unwrap().mip_levels(), 7);
    let backbuffer = graph.backbuffer().unwrap();
    let present = fullscreen_pipeline(&mut graph, "present", 4000, TargetFormat::Backbuffer, 1);
    let set = sampling_set(&mut graph, present, &[texture]);
    graph
        .register_pass(novade_frame_graph::PassDesc::generate_mips("albedo-mips", texture))
        .unwrap();
    graph
        .register_pass(blit_pass("present", &[texture], backbuffer, present, set))
        .unwrap();

    let first = graph.run_frame().unwrap();
    assert_eq!(first.passes_executed, vec!["albedo-mips", "present"]);
    let second = graph.run_frame().unwrap();
    assert_eq!(second.passes_executed, vec!["present"]);
    graph.backend().complete_all();
    assert_eq!(graph.backend().stats().blits, 6);
    assert!(graph.device().arena().image(texture).unwrap().mips_generated());
    assert_eq!(graph.backend().violations(), Vec::<String>::new());
}
