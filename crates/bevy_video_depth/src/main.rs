#![recursion_limit = "256"]

use std::{
    f32::consts::FRAC_PI_2,
    path::{Path, PathBuf},
    time::Duration,
};

use bevy::{
    color::palettes::css::GOLD,
    diagnostic::{
        Diagnostic, DiagnosticPath, Diagnostics, DiagnosticsStore, FrameTimeDiagnosticsPlugin,
        RegisterDiagnostic,
    },
    prelude::*,
    render::view::screenshot::{Screenshot, ScreenshotCaptured},
    tasks::{AsyncComputeTaskPool, Task, block_on, futures_lite::future},
    window::{PrimaryWindow, WindowResized},
};
use bevy_args::{Deserialize, Parser, Serialize, parse_args};
use bevy_video_depth::{
    BevyCompositeRenderer, BoundTextures, CompositeMaterial, CompositePlugin, platform,
};
use burn_video_depth::{
    CameraProjection, DepthField, DepthPipelineConfig, DepthVideoContext, DepthVideoError,
    PendingRecording, PyDNet, PyDNetConfig, RecordingArtifact, RecordingConfig,
    RenderLoopController, Viewport, model::DEFAULT_CHECKPOINT,
};
use burn_wgpu::{Wgpu, WgpuDevice};

const GRID_COLOR: Color = Color::srgb(0.53, 0.53, 0.53);

#[derive(Resource, Clone, Debug, Serialize, Deserialize, Parser, Reflect)]
#[reflect(Resource)]
#[command(about = "bevy_video_depth", version, long_about = None)]
pub struct BevyVideoDepthConfig {
    #[arg(long, default_value = "true")]
    pub press_esc_to_close: bool,

    #[arg(long, default_value = "true")]
    pub show_fps: bool,

    #[arg(long, default_value = DEFAULT_CHECKPOINT)]
    pub checkpoint: PathBuf,

    #[arg(long)]
    pub video_path: Option<PathBuf>,

    #[arg(long)]
    pub image_path: Option<PathBuf>,

    #[arg(long, default_value = "true")]
    pub record: bool,

    #[arg(long, default_value = "image/gif")]
    pub record_mime: String,

    #[arg(long, default_value = "30")]
    pub record_fps: u32,

    #[arg(long, default_value = "1000")]
    pub record_slice_ms: u64,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

impl Default for BevyVideoDepthConfig {
    fn default() -> Self {
        Self {
            press_esc_to_close: true,
            show_fps: true,
            checkpoint: PathBuf::from(DEFAULT_CHECKPOINT),
            video_path: None,
            image_path: None,
            record: true,
            record_mime: "image/gif".to_string(),
            record_fps: 30,
            record_slice_ms: 1000,
            output_dir: PathBuf::from("."),
        }
    }
}

impl BevyVideoDepthConfig {
    fn recording(&self) -> RecordingConfig {
        RecordingConfig {
            mime_type: self.record_mime.clone(),
            frame_rate: self.record_fps,
            slice_interval: Duration::from_millis(self.record_slice_ms),
            ..RecordingConfig::default()
        }
    }
}

type ViewerContext = DepthVideoContext<Wgpu, PyDNet<Wgpu>>;

#[derive(Resource, Default)]
struct ModelLoad(Option<Task<burn_video_depth::Result<ViewerContext>>>);

/// Everything that exists once the model is up.
#[derive(Resource)]
struct Viewer {
    context: ViewerContext,
    controller: RenderLoopController<Task<burn_video_depth::Result<DepthField>>>,
}

#[derive(Resource)]
struct CompositeQuad(Handle<CompositeMaterial>);

/// Encoder drain and file write for a stopped recording, off the render
/// thread.
#[derive(Resource, Default)]
struct RecordingSave(Option<Task<()>>);

fn viewport_of(window: &Window) -> Viewport {
    Viewport::new(window.width(), window.height(), window.scale_factor())
}

fn setup_scene(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<CompositeMaterial>>,
) {
    let projection = CameraProjection::default();
    commands.spawn((
        Camera3d::default(),
        Projection::from(PerspectiveProjection {
            fov: projection.fov_y_radians,
            aspect_ratio: projection.aspect_ratio,
            near: projection.near,
            far: projection.far,
            ..default()
        }),
        Transform::from_xyz(0.0, 0.0, 0.5).looking_at(Vec3::ZERO, Vec3::Y),
    ));

    let material = materials.add(CompositeMaterial::default());
    commands.spawn((
        Mesh3d(meshes.add(Rectangle::new(1.0, 1.0))),
        MeshMaterial3d(material.clone()),
        Transform::IDENTITY,
    ));
    commands.insert_resource(CompositeQuad(material));
}

fn draw_grid(mut gizmos: Gizmos) {
    gizmos.grid(
        Isometry3d::from_rotation(Quat::from_rotation_x(FRAC_PI_2)),
        UVec2::splat(10),
        Vec2::splat(1.0),
        GRID_COLOR,
    );
}

fn begin_model_load(
    mut load: ResMut<ModelLoad>,
    viewer: Option<Res<Viewer>>,
    config: Res<BevyVideoDepthConfig>,
) {
    if viewer.is_some() || load.0.is_some() {
        return;
    }

    let checkpoint = config.checkpoint.clone();
    let recording = config.recording();
    info!("loading depth model from {}", checkpoint.display());

    load.0 = Some(AsyncComputeTaskPool::get().spawn(async move {
        let device = WgpuDevice::default();
        DepthVideoContext::load(
            &device,
            checkpoint,
            PyDNetConfig::new(),
            DepthPipelineConfig::new(),
            recording,
        )
    }));
}

fn finish_model_load(
    mut commands: Commands,
    mut load: ResMut<ModelLoad>,
    mut exit: MessageWriter<AppExit>,
    config: Res<BevyVideoDepthConfig>,
    windows: Query<&Window, With<PrimaryWindow>>,
) {
    let Some(task) = load.0.as_mut() else {
        return;
    };
    let Some(result) = block_on(future::poll_once(task)) else {
        return;
    };
    load.0 = None;

    let mut context = match result {
        Ok(context) => context,
        Err(err) => {
            error!("{err}");
            exit.write(AppExit::error());
            return;
        }
    };
    info!("depth model ready");

    let viewport = windows.single().map(viewport_of).unwrap_or_default();
    let mut controller = context.controller(viewport);

    match platform::open_source(config.video_path.as_deref(), config.image_path.as_deref()) {
        Ok(source) => {
            if controller.attach_source(source) && config.record {
                context.start_recording();
            }
        }
        Err(DepthVideoError::NoFileSelected) => info!("no media selected, nothing to stream"),
        Err(err) => warn!("{err}"),
    }

    commands.insert_resource(Viewer {
        context,
        controller,
    });
}

fn track_window_resize(
    mut resized: MessageReader<WindowResized>,
    windows: Query<&Window, With<PrimaryWindow>>,
    viewer: Option<ResMut<Viewer>>,
) {
    if resized.read().last().is_none() {
        return;
    }
    let (Some(mut viewer), Ok(window)) = (viewer, windows.single()) else {
        return;
    };
    viewer.controller.resize(viewport_of(window));
}

#[allow(clippy::too_many_arguments)]
fn drive_render_loop(
    viewer: Option<ResMut<Viewer>>,
    quad: Res<CompositeQuad>,
    config: Res<BevyVideoDepthConfig>,
    mut bound: ResMut<BoundTextures>,
    mut images: ResMut<Assets<Image>>,
    mut materials: ResMut<Assets<CompositeMaterial>>,
    mut cameras: Query<&mut Projection, With<Camera3d>>,
    mut diagnostics: Diagnostics,
    mut last_inference: Local<Time<Real>>,
    mut save: ResMut<RecordingSave>,
) {
    let Some(viewer) = viewer else {
        return;
    };
    let viewer = viewer.into_inner();

    let mut renderer = BevyCompositeRenderer {
        images: &mut images,
        materials: &mut materials,
        material: quad.0.id(),
        projection: cameras.single_mut().ok().map(Mut::into_inner),
        bound: &mut bound,
    };

    let pipeline = viewer.context.pipeline().clone();
    let report = viewer.controller.tick(&mut renderer, |frame| {
        AsyncComputeTaskPool::get().spawn(async move { pipeline.infer(&frame).await })
    });

    if report.depth_updated {
        if let Some(last_instant) = last_inference.last_update() {
            let delta_seconds = last_instant.elapsed().as_secs_f64();
            if delta_seconds > 0.0 {
                diagnostics.add_measurement(&INFERENCE_FPS, || 1.0 / delta_seconds);
            }
        }
        last_inference.update();
    }

    if report.source_ended {
        if let Some(pending) = viewer.context.recorder_mut().finish() {
            let output_dir = config.output_dir.clone();
            save.0 = Some(AsyncComputeTaskPool::get().spawn(async move {
                finalize_recording(pending, &output_dir);
            }));
        }
    }
}

fn poll_recording_save(mut save: ResMut<RecordingSave>) {
    let Some(task) = save.0.as_mut() else {
        return;
    };
    if block_on(future::poll_once(task)).is_some() {
        save.0 = None;
    }
}

fn capture_canvas(mut commands: Commands, viewer: Option<ResMut<Viewer>>, time: Res<Time<Real>>) {
    let Some(mut viewer) = viewer else {
        return;
    };
    let now = time.elapsed();
    if !viewer.context.recorder_mut().capture_due(now) {
        return;
    }

    commands.spawn(Screenshot::primary_window()).observe(
        move |captured: On<ScreenshotCaptured>, viewer: Option<ResMut<Viewer>>| {
            let Some(mut viewer) = viewer else {
                return;
            };
            let canvas = match captured.image.clone().try_into_dynamic() {
                Ok(image) => image.to_rgba8(),
                Err(err) => {
                    warn!("dropping captured frame: {err:?}");
                    return;
                }
            };
            if let Err(err) = viewer.context.recorder_mut().push_frame(canvas, now) {
                warn!("{err}");
            }
        },
    );
}

fn teardown_on_exit(
    mut exits: MessageReader<AppExit>,
    viewer: Option<ResMut<Viewer>>,
    mut save: ResMut<RecordingSave>,
    config: Res<BevyVideoDepthConfig>,
) {
    if exits.read().last().is_none() {
        return;
    }

    // the app is closing, so waiting here no longer costs frames
    if let Some(task) = save.0.take() {
        block_on(task);
    }

    let Some(mut viewer) = viewer else {
        return;
    };
    match viewer.context.teardown() {
        Ok(Some(artifact)) => save_recording(&artifact, &config.output_dir),
        Ok(None) => {}
        Err(err) => error!("recording not saved: {err}"),
    }
}

fn finalize_recording(pending: PendingRecording, output_dir: &Path) {
    match pending.wait() {
        Ok(artifact) => save_recording(&artifact, output_dir),
        Err(err) => error!("recording not saved: {err}"),
    }
}

fn save_recording(artifact: &RecordingArtifact, output_dir: &Path) {
    if artifact.is_empty() {
        warn!("recording produced no data");
        return;
    }
    if artifact.dropped_frames > 0 {
        info!(
            "{} captures skipped while the encoder was busy",
            artifact.dropped_frames
        );
    }
    match artifact.save_to(output_dir) {
        Ok(path) => info!("recording written to {}", path.display()),
        Err(err) => error!("failed to write recording: {err}"),
    }
}

pub fn viewer_app(args: BevyVideoDepthConfig) -> App {
    let mut app = App::new();
    app.insert_resource(args.clone());

    let primary_window = Some(Window {
        mode: bevy::window::WindowMode::Windowed,
        prevent_default_event_handling: false,
        resolution: bevy::window::WindowResolution::new(1024, 1024),
        title: "bevy_video_depth".to_string(),
        #[cfg(feature = "perftest")]
        present_mode: bevy::window::PresentMode::AutoNoVsync,
        #[cfg(not(feature = "perftest"))]
        present_mode: bevy::window::PresentMode::AutoVsync,
        ..default()
    });

    app.insert_resource(ClearColor(Color::srgba(0.0, 0.0, 0.0, 0.0)));

    let default_plugins = DefaultPlugins
        .set(ImagePlugin::default_nearest())
        .set(WindowPlugin {
            primary_window,
            ..default()
        });

    app.add_plugins(default_plugins);
    app.add_plugins(CompositePlugin);

    if args.press_esc_to_close {
        app.add_systems(Update, press_esc_close);
    }

    if args.show_fps {
        app.add_plugins(FrameTimeDiagnosticsPlugin::default());
        app.add_systems(Startup, fps_display_setup);
        app.add_systems(Update, fps_update_system);
    }
    app.register_diagnostic(Diagnostic::new(INFERENCE_FPS));

    app
}

fn press_esc_close(keys: Res<ButtonInput<KeyCode>>, mut exit: MessageWriter<AppExit>) {
    if keys.just_pressed(KeyCode::Escape) {
        exit.write(AppExit::Success);
    }
}

const INFERENCE_FPS: DiagnosticPath = DiagnosticPath::const_new("inference_fps");

fn fps_display_setup(mut commands: Commands) {
    commands
        .spawn((
            Text("fps: ".to_string()),
            TextFont {
                font_size: 60.0,
                ..Default::default()
            },
            TextColor(Color::WHITE),
            Node {
                position_type: PositionType::Absolute,
                bottom: Val::Px(5.0),
                left: Val::Px(15.0),
                ..default()
            },
            ZIndex(2),
        ))
        .with_child((
            FpsText,
            TextColor(Color::Srgba(GOLD)),
            TextFont {
                font_size: 60.0,
                ..Default::default()
            },
            TextSpan::default(),
        ));
}

#[derive(Component)]
struct FpsText;

fn fps_update_system(
    diagnostics: Res<DiagnosticsStore>,
    mut query: Query<&mut TextSpan, With<FpsText>>,
) {
    for mut text in &mut query {
        if let Some(value) = diagnostics
            .get(&INFERENCE_FPS)
            .and_then(|fps| fps.smoothed())
        {
            **text = format!("{value:.2}");
        }
    }
}

fn run_app(args: BevyVideoDepthConfig) {
    let mut app = viewer_app(args);

    app.init_resource::<ModelLoad>();
    app.init_resource::<RecordingSave>();
    app.add_systems(Startup, setup_scene);
    app.add_systems(
        Update,
        (
            begin_model_load,
            finish_model_load,
            track_window_resize,
            drive_render_loop,
            capture_canvas,
            poll_recording_save,
        )
            .chain(),
    );
    app.add_systems(Update, draw_grid);
    app.add_systems(Last, teardown_on_exit);

    app.run();
}

fn main() {
    let args = parse_args::<BevyVideoDepthConfig>();
    run_app(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_flags_map_onto_recording_config() {
        let config = BevyVideoDepthConfig {
            record_mime: "video/webm; codecs=vp9".to_string(),
            record_fps: 12,
            record_slice_ms: 250,
            ..Default::default()
        };
        let recording = config.recording();

        assert_eq!(recording.mime_type, "video/webm; codecs=vp9");
        assert_eq!(recording.frame_rate, 12);
        assert_eq!(recording.slice_interval, Duration::from_millis(250));
        assert_eq!(recording.file_stem, "recordingVideo");
    }

    #[test]
    fn cli_defaults_match_default_config() {
        let parsed = BevyVideoDepthConfig::parse_from(["bevy_video_depth"]);
        let defaults = BevyVideoDepthConfig::default();

        assert_eq!(parsed.checkpoint, defaults.checkpoint);
        assert_eq!(parsed.record_mime, defaults.record_mime);
        assert_eq!(parsed.record_fps, defaults.record_fps);
        assert_eq!(parsed.output_dir, defaults.output_dir);
        assert!(parsed.video_path.is_none());
    }
}
