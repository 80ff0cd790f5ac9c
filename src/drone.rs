// High-level interface to the AR.Drone
// Owns the link state machine, the links and the two background tasks

use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{CTRL_ACK_CONFIG, Command};
use crate::link::{CommandLink, ControlLink, TelemetryLink, Transport, UdpTransport};
use crate::navdata::{Mode, NavData};
use crate::queue::{CommandQueue, NavDataQueue};
use crate::reader::{NavDataReader, ReaderHandle};
use crate::sender::CommandSender;
use crate::{ConnectionState, DroneConfig};

const NAVDATA_DEMO_KEY: &str = "general:navdata_demo";

/// Client for one AR.Drone
///
/// The client owns the link state machine and, while connected, the command
/// and telemetry links together with the tasks using them:
/// - the command sender, sending the queued commands
/// - the navdata reader, receiving navdata and feeding [navdata_received](Self::navdata_received)
///
/// All methods take `&self`, the client is meant to be shared between tasks
/// in an `Arc`. Must be used from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> anyhow::Result<()> {
/// use ardrone::{ARDrone, ConnectionState};
///
/// let drone = ARDrone::new();
/// drone.connect().await?;
/// assert_eq!(drone.state(), ConnectionState::Bootstrap);
///
/// drone.send_demo_navigation_data()?;
/// drone.mark_ready()?;
/// drone.take_off()?;
/// drone.land()?;
///
/// drone.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct ARDrone<T: Transport = UdpTransport> {
    config: DroneConfig,
    transport: T,
    shared: Arc<Shared>,
    connection: tokio::sync::Mutex<Option<Connection<T>>>,
    combined_yaw: AtomicBool,
}

// State shared with the navdata reader
#[derive(Debug)]
struct Shared {
    state: Mutex<ConnectionState>,
    navdata: NavDataQueue,
    commands: Mutex<Option<Arc<CommandQueue>>>,
    last_error: Mutex<Option<String>>,
    // Emergency flag of the drone, as reported by the last navdata
    emergency: AtomicBool,
}

impl Shared {
    fn change_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock();
        debug!("State changed from {} to {}", *state, new_state);
        *state = new_state;
    }

    fn navdata_received(&self, navdata: NavData) {
        self.emergency.store(navdata.is_emergency(), Ordering::Release);

        let mut state = self.state.lock();
        if *state != ConnectionState::Bootstrap && navdata.mode() == Mode::Bootstrap {
            info!("Drone is in bootstrap mode, state changed from {} to {}", *state, ConnectionState::Bootstrap);
            *state = ConnectionState::Bootstrap;
        }

        // Decided under the state lock so that no navdata slips in after leaving Ready
        if *state == ConnectionState::Ready {
            self.navdata.push(navdata);
        }
    }
}

// Resources of one open link
struct Connection<T: Transport> {
    queue: Arc<CommandQueue>,
    sender: JoinHandle<()>,
    reader: ReaderHandle,
    command: Arc<T::Command>,
    telemetry: Arc<T::Telemetry>,
    control: Option<T::Control>,
}

// Steps of the link shutdown, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStep {
    QueueQuit,
    StopReader,
    CloseCommand,
    CloseTelemetry,
    CloseControl,
}

#[derive(Debug, Default)]
struct ShutdownReport {
    attempted: Vec<ShutdownStep>,
    failed: Vec<ShutdownStep>,
    first_error: Option<anyhow::Error>,
}

impl ShutdownReport {
    fn record(&mut self, step: ShutdownStep, result: anyhow::Result<()>) {
        self.attempted.push(step);
        if let Err(e) = result {
            debug!("Shutdown step {:?} failed: {:#}", step, e);
            self.failed.push(step);
            self.first_error.get_or_insert(e);
        }
    }
}

impl<T: Transport> Connection<T> {
    // Every step is executed whatever happened to the previous ones. The
    // control channel is closed last as it is the most likely to fail.
    async fn shutdown(self, reader_timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        report.record(ShutdownStep::QueueQuit, self.queue.push(Command::Quit));
        report.record(ShutdownStep::StopReader, self.reader.stop(reader_timeout).await);
        report.record(
            ShutdownStep::CloseCommand,
            self.command.close().context("Failed to close the command link"),
        );
        report.record(
            ShutdownStep::CloseTelemetry,
            self.telemetry.close().context("Failed to close the navdata link"),
        );
        let control = match &self.control {
            Some(control) => control.close().await.context("Failed to close the control channel"),
            None => Ok(()),
        };
        report.record(ShutdownStep::CloseControl, control);

        // The sender has either popped the quit command or lost its link by now
        drop(self.sender);
        report
    }

    // Best effort shutdown when the client is dropped without disconnecting
    fn abandon(self) {
        self.reader.request_stop();
        self.queue.close();
        let _ = self.command.close();
        let _ = self.telemetry.close();
    }
}

impl ARDrone<UdpTransport> {
    /// Create a client for a drone at the default address (192.168.1.1)
    pub fn new() -> Self {
        Self::with_config(DroneConfig::default())
    }

    /// Create a client for a drone at the given address
    pub fn with_address(address: IpAddr) -> Self {
        Self::with_config(DroneConfig::default().with_address(address))
    }

    /// Create a client from a configuration
    pub fn with_config(config: DroneConfig) -> Self {
        Self::with_transport(config, UdpTransport)
    }
}

impl Default for ARDrone<UdpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> ARDrone<T> {
    /// Create a client using a custom transport
    ///
    /// # Arguments
    ///
    /// * `config` - The link configuration, passed to the transport
    /// * `transport` - Opens the links on [connect](Self::connect)
    pub fn with_transport(config: DroneConfig, transport: T) -> Self {
        ARDrone {
            config,
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                navdata: NavDataQueue::new(),
                commands: Mutex::new(None),
                last_error: Mutex::new(None),
                emergency: AtomicBool::new(false),
            }),
            connection: tokio::sync::Mutex::new(None),
            combined_yaw: AtomicBool::new(false),
        }
    }

    /// Configuration of the client
    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// Current link state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Cause of the last transition to [ConnectionState::Error]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Navdata received while the link was [Ready](ConnectionState::Ready)
    pub fn navdata(&self) -> &NavDataQueue {
        &self.shared.navdata
    }

    /// Command queue of the open link
    ///
    /// # Returns
    ///
    /// `None` when not connected
    pub fn command_queue(&self) -> Option<Arc<CommandQueue>> {
        self.shared.commands.lock().clone()
    }

    /// Open the link to the drone
    ///
    /// Binds the navdata and command sockets, starts the command sender and the
    /// navdata reader and enters [ConnectionState::Bootstrap].
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not [Disconnected](ConnectionState::Disconnected).
    /// If the link cannot be opened, the client enters [ConnectionState::Error]
    /// and the cause is returned.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.lock().await;
        let state = self.state();
        if connection.is_some() || state != ConnectionState::Disconnected {
            bail!("Cannot connect, link is {}", state);
        }

        match self.open().await {
            Ok(opened) => {
                *connection = Some(opened);
                self.shared.change_state(ConnectionState::Bootstrap);
                info!("Connected to drone at {}", self.config.address);
                Ok(())
            }
            Err(e) => {
                self.enter_error_state(&mut connection, format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    async fn open(&self) -> anyhow::Result<Connection<T>> {
        let telemetry = self
            .transport
            .open_telemetry(&self.config)
            .await
            .with_context(|| format!("Failed to bind navdata socket on {}", self.config.navdata_bind_addr()))?;
        let command = self
            .transport
            .open_command(&self.config)
            .await
            .context("Failed to open command socket")?;
        let control = self
            .transport
            .open_control(&self.config)
            .await
            .with_context(|| format!("Failed to open control channel to {}", self.config.control_addr()))?;

        let command = Arc::new(command);
        let telemetry = Arc::new(telemetry);
        let queue = Arc::new(CommandQueue::new());

        let sender = CommandSender::new(queue.clone(), command.clone()).spawn();
        let shared = self.shared.clone();
        let reader = NavDataReader::new(telemetry.clone(), self.config.reader_poll_interval)
            .spawn(move |navdata| shared.navdata_received(navdata));

        self.shared.emergency.store(false, Ordering::Release);
        *self.shared.commands.lock() = Some(queue.clone());

        Ok(Connection { queue, sender, reader, command, telemetry, control })
    }

    /// Close the link to the drone
    ///
    /// Always ends in [ConnectionState::Disconnected]. Failures while closing
    /// the link are logged and otherwise ignored.
    pub async fn disconnect(&self) {
        self.disconnect_with_report().await;
    }

    async fn disconnect_with_report(&self) -> Option<ShutdownReport> {
        let mut connection = self.connection.lock().await;
        let report = self.teardown(&mut connection).await;
        self.shared.change_state(ConnectionState::Disconnected);
        info!("Disconnected from drone at {}", self.config.address);
        report
    }

    /// Close the link, if open, and enter [ConnectionState::Error]
    ///
    /// Failures while closing the link are ignored. The client stays in the
    /// error state until [disconnect](Self::disconnect) is called.
    ///
    /// # Arguments
    ///
    /// * `cause` - Reason of the failure, available through [last_error](Self::last_error)
    pub async fn change_to_error_state(&self, cause: impl Display) {
        let mut connection = self.connection.lock().await;
        self.enter_error_state(&mut connection, cause.to_string()).await;
    }

    async fn enter_error_state(&self, connection: &mut Option<Connection<T>>, cause: String) {
        if self.state() != ConnectionState::Disconnected {
            self.teardown(connection).await;
        }

        let mut state = self.shared.state.lock();
        warn!("State changed from {} to {}: {}", *state, ConnectionState::Error, cause);
        *state = ConnectionState::Error;
        *self.shared.last_error.lock() = Some(cause);
    }

    // Taking the connection out of its slot makes the shutdown run at most once
    async fn teardown(&self, connection: &mut Option<Connection<T>>) -> Option<ShutdownReport> {
        let opened = connection.take()?;
        self.shared.commands.lock().take();

        let report = opened.shutdown(self.config.reader_stop_timeout).await;
        if let Some(e) = &report.first_error {
            warn!("Error while closing the link: {:#}", e);
        }
        Some(report)
    }

    /// Mark the link as ready, navdata is then delivered to [navdata](Self::navdata)
    ///
    /// # Errors
    ///
    /// Returns an error if the link is not open
    pub fn mark_ready(&self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        if !state.is_connected() {
            bail!("Cannot mark the link ready, link is {}", *state);
        }
        debug!("State changed from {} to {}", *state, ConnectionState::Ready);
        *state = ConnectionState::Ready;
        Ok(())
    }

    /// Handle one navdata from the drone
    ///
    /// Called by the navdata reader. Navdata in bootstrap mode means that the
    /// drone has (re)started: the client goes back to [ConnectionState::Bootstrap].
    /// The navdata is queued in [navdata](Self::navdata) only while the link is
    /// [Ready](ConnectionState::Ready), it is dropped otherwise.
    pub fn navdata_received(&self, navdata: NavData) {
        self.shared.navdata_received(navdata);
    }

    fn enqueue(&self, command: Command) -> anyhow::Result<()> {
        command.validate()?;
        let Some(queue) = self.command_queue() else {
            bail!("Not connected, cannot send {:?}", command);
        };
        queue.push(command)
    }

    /// Queue a command
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or for [Command::Quit], which is
    /// reserved to the disconnection
    pub fn send(&self, command: Command) -> anyhow::Result<()> {
        if command.is_quit() {
            return Err(anyhow!("Quit is only sent when disconnecting"));
        }
        self.enqueue(command)
    }

    /// Flat trim, the drone must be on flat ground
    pub fn trim(&self) -> anyhow::Result<()> {
        self.enqueue(Command::FlatTrim)
    }

    /// Take off
    pub fn take_off(&self) -> anyhow::Result<()> {
        self.enqueue(Command::TakeOff)
    }

    /// Land
    pub fn land(&self) -> anyhow::Result<()> {
        self.enqueue(Command::Land)
    }

    /// Hold position
    pub fn hover(&self) -> anyhow::Result<()> {
        self.enqueue(Command::Hover)
    }

    /// Enter emergency mode, the motors are cut
    ///
    /// Nothing is sent if the last navdata already reported an emergency.
    pub fn send_emergency_signal(&self) -> anyhow::Result<()> {
        self.toggle_emergency(true)
    }

    /// Leave emergency mode
    ///
    /// Nothing is sent unless the last navdata reported an emergency.
    pub fn clear_emergency_signal(&self) -> anyhow::Result<()> {
        self.toggle_emergency(false)
    }

    /// True if the last navdata received reported an emergency
    pub fn is_emergency(&self) -> bool {
        self.shared.emergency.load(Ordering::Acquire)
    }

    // The emergency flag is a toggle on the drone, only flip it towards `wanted`
    fn toggle_emergency(&self, wanted: bool) -> anyhow::Result<()> {
        let Some(queue) = self.command_queue() else {
            bail!("Not connected, cannot change the emergency mode");
        };
        if self.is_emergency() == wanted {
            debug!("Drone emergency mode already {}, nothing sent", wanted);
            return Ok(());
        }
        queue.push(Command::Emergency)
    }

    /// Set the piloting setpoint, all values are in the range [-1.0, 1.0]
    ///
    /// Values are clamped to the valid range.
    pub fn set(&self, roll: f32, pitch: f32, gaz: f32, yaw: f32) -> anyhow::Result<()> {
        self.enqueue(Command::Move {
            roll: roll.clamp(-1.0, 1.0),
            pitch: pitch.clamp(-1.0, 1.0),
            gaz: gaz.clamp(-1.0, 1.0),
            yaw: yaw.clamp(-1.0, 1.0),
            combined_yaw: self.is_combined_yaw_mode(),
        })
    }

    /// In combined yaw mode, roll also turns the drone
    pub fn set_combined_yaw_mode(&self, enabled: bool) {
        self.combined_yaw.store(enabled, Ordering::Relaxed);
    }

    /// True if combined yaw mode is enabled
    pub fn is_combined_yaw_mode(&self) -> bool {
        self.combined_yaw.load(Ordering::Relaxed)
    }

    /// Ask the drone for the full navdata set
    pub fn send_all_navigation_data(&self) -> anyhow::Result<()> {
        self.enqueue(Command::configure(NAVDATA_DEMO_KEY, "FALSE"))
    }

    /// Ask the drone for the reduced navdata set
    pub fn send_demo_navigation_data(&self) -> anyhow::Result<()> {
        self.enqueue(Command::configure(NAVDATA_DEMO_KEY, "TRUE"))?;
        self.enqueue(Command::Control { mode: CTRL_ACK_CONFIG })
    }

    /// Write a configuration key on the drone
    ///
    /// # Errors
    ///
    /// Returns an error if not connected, or if the name or the value contains
    /// a quote or a line terminator
    pub fn set_config_option(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.enqueue(Command::configure(name, value))
    }

    /// Play a LED animation
    ///
    /// # Arguments
    ///
    /// * `animation` - Animation number
    /// * `frequency` - Frequency in Hz
    /// * `duration` - Duration in seconds
    pub fn play_led(&self, animation: u32, frequency: f32, duration: u32) -> anyhow::Result<()> {
        self.enqueue(Command::PlayLed { animation, frequency, duration })
    }

    /// Play a flight animation
    ///
    /// # Arguments
    ///
    /// * `animation` - Animation number
    /// * `duration` - Duration in milliseconds
    pub fn play_animation(&self, animation: u32, duration: u32) -> anyhow::Result<()> {
        self.enqueue(Command::PlayAnimation { animation, duration })
    }
}

impl<T: Transport> Drop for ARDrone<T> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::sync::Notify;

    const BOOTSTRAP: u32 = 1 << 11;
    const EMERGENCY: u32 = 1 << 31;

    #[derive(Debug, Default, Clone, Copy)]
    struct Faults {
        open_telemetry: bool,
        close_command: bool,
        close_telemetry: bool,
        close_control: bool,
        reader_panics: bool,
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        frames: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }
    }

    fn fault(name: &str) -> io::Error {
        io::Error::other(format!("injected {} failure", name))
    }

    struct FakeTransport {
        faults: Faults,
        recorder: Arc<Recorder>,
    }

    struct FakeCommand {
        faults: Faults,
        recorder: Arc<Recorder>,
    }

    impl CommandLink for FakeCommand {
        async fn send(&self, frame: &[u8]) -> io::Result<()> {
            self.recorder.frames.lock().push(String::from_utf8_lossy(frame).into_owned());
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            self.recorder.events.lock().push("command.close");
            if self.faults.close_command { Err(fault("command close")) } else { Ok(()) }
        }
    }

    struct FakeTelemetry {
        faults: Faults,
        recorder: Arc<Recorder>,
        closed: AtomicBool,
        wake: Notify,
    }

    // Never receives anything, blocks until closed
    impl TelemetryLink for FakeTelemetry {
        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            if self.faults.reader_panics {
                panic!("injected reader failure");
            }
            loop {
                let notified = self.wake.notified();
                if self.closed.load(Ordering::Acquire) {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                notified.await;
            }
        }

        fn close(&self) -> io::Result<()> {
            self.recorder.events.lock().push("telemetry.close");
            self.closed.store(true, Ordering::Release);
            self.wake.notify_waiters();
            if self.faults.close_telemetry { Err(fault("telemetry close")) } else { Ok(()) }
        }
    }

    struct FakeControl {
        faults: Faults,
        recorder: Arc<Recorder>,
    }

    impl ControlLink for FakeControl {
        async fn close(&self) -> io::Result<()> {
            self.recorder.events.lock().push("control.close");
            if self.faults.close_control { Err(fault("control close")) } else { Ok(()) }
        }
    }

    impl Transport for FakeTransport {
        type Command = FakeCommand;
        type Telemetry = FakeTelemetry;
        type Control = FakeControl;

        async fn open_command(&self, _config: &DroneConfig) -> io::Result<FakeCommand> {
            Ok(FakeCommand { faults: self.faults, recorder: self.recorder.clone() })
        }

        async fn open_telemetry(&self, _config: &DroneConfig) -> io::Result<FakeTelemetry> {
            if self.faults.open_telemetry {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "navdata port in use"));
            }
            Ok(FakeTelemetry {
                faults: self.faults,
                recorder: self.recorder.clone(),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
            })
        }

        async fn open_control(&self, _config: &DroneConfig) -> io::Result<Option<FakeControl>> {
            Ok(Some(FakeControl { faults: self.faults, recorder: self.recorder.clone() }))
        }
    }

    fn fake_drone(faults: Faults) -> (ARDrone<FakeTransport>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = DroneConfig::default()
            .with_reader_poll_interval(Duration::from_millis(10))
            .with_reader_stop_timeout(Duration::from_millis(500));
        let drone = ARDrone::with_transport(config, FakeTransport { faults, recorder: recorder.clone() });
        (drone, recorder)
    }

    async fn wait_for_frames(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.frames.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames not sent in time");
    }

    const ALL_STEPS: [ShutdownStep; 5] = [
        ShutdownStep::QueueQuit,
        ShutdownStep::StopReader,
        ShutdownStep::CloseCommand,
        ShutdownStep::CloseTelemetry,
        ShutdownStep::CloseControl,
    ];

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let (drone, _) = fake_drone(Faults::default());
        assert_eq!(drone.state(), ConnectionState::Disconnected);
        assert!(drone.command_queue().is_none());
        assert!(drone.last_error().is_none());
        assert!(drone.trim().is_err());
    }

    #[tokio::test]
    async fn test_connect_enters_bootstrap() {
        let (drone, _) = fake_drone(Faults::default());
        drone.connect().await.unwrap();

        assert_eq!(drone.state(), ConnectionState::Bootstrap);
        assert!(drone.command_queue().is_some());

        // Already connected
        assert!(drone.connect().await.is_err());
        assert_eq!(drone.state(), ConnectionState::Bootstrap);

        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_enters_error() {
        let (drone, recorder) = fake_drone(Faults { open_telemetry: true, ..Default::default() });

        let err = drone.connect().await.unwrap_err();
        assert!(format!("{:#}", err).contains("navdata port in use"), "{:#}", err);
        assert_eq!(drone.state(), ConnectionState::Error);
        assert!(drone.last_error().unwrap().contains("Failed to bind navdata socket"));
        // Nothing was opened, nothing to close
        assert!(recorder.events().is_empty());

        // Error is sticky until disconnect
        assert!(drone.connect().await.is_err());
        drone.disconnect().await;
        assert_eq!(drone.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (drone, recorder) = fake_drone(Faults::default());
        drone.connect().await.unwrap();
        drone.disconnect().await;
        drone.connect().await.unwrap();
        drone.trim().unwrap();
        wait_for_frames(&recorder, 1).await;

        // The sequence restarts with the new link
        assert_eq!(recorder.frames.lock()[0], "AT*FTRIM=1\r");
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_clean_disconnect_runs_every_step() {
        let (drone, recorder) = fake_drone(Faults::default());
        drone.connect().await.unwrap();

        let report = drone.disconnect_with_report().await.unwrap();
        assert_eq!(report.attempted, ALL_STEPS);
        assert!(report.failed.is_empty());
        assert!(report.first_error.is_none());
        assert_eq!(recorder.events(), vec!["command.close", "telemetry.close", "control.close"]);
        assert_eq!(drone.state(), ConnectionState::Disconnected);
        assert!(drone.command_queue().is_none());

        // Nothing left to close
        assert!(drone.disconnect_with_report().await.is_none());
        assert_eq!(drone.state(), ConnectionState::Disconnected);
    }

    async fn connected_drone(faults: Faults) -> (ARDrone<FakeTransport>, Arc<Recorder>) {
        let (drone, recorder) = fake_drone(faults);
        drone.connect().await.unwrap();
        (drone, recorder)
    }

    async fn assert_disconnect_survives(drone: ARDrone<FakeTransport>, recorder: Arc<Recorder>, failing: ShutdownStep) {
        let report = drone.disconnect_with_report().await.unwrap();
        assert_eq!(report.attempted, ALL_STEPS);
        assert_eq!(report.failed, vec![failing]);
        assert!(report.first_error.is_some());
        assert_eq!(recorder.events(), vec!["command.close", "telemetry.close", "control.close"]);
        assert_eq!(drone.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_quit_cannot_be_queued() {
        let (drone, recorder) = connected_drone(Faults::default()).await;
        drone.command_queue().unwrap().close();
        assert_disconnect_survives(drone, recorder, ShutdownStep::QueueQuit).await;
    }

    #[tokio::test]
    async fn test_disconnect_when_reader_has_crashed() {
        let (drone, recorder) = connected_drone(Faults { reader_panics: true, ..Default::default() }).await;

        // The reader has to run its first receive before the stop request
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if drone.connection.lock().await.as_ref().unwrap().reader.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reader did not crash");

        assert_disconnect_survives(drone, recorder, ShutdownStep::StopReader).await;
    }

    #[tokio::test]
    async fn test_disconnect_when_command_close_fails() {
        let (drone, recorder) = connected_drone(Faults { close_command: true, ..Default::default() }).await;
        assert_disconnect_survives(drone, recorder, ShutdownStep::CloseCommand).await;
    }

    #[tokio::test]
    async fn test_disconnect_when_telemetry_close_fails() {
        let (drone, recorder) = connected_drone(Faults { close_telemetry: true, ..Default::default() }).await;
        assert_disconnect_survives(drone, recorder, ShutdownStep::CloseTelemetry).await;
    }

    #[tokio::test]
    async fn test_disconnect_when_control_close_fails() {
        let (drone, recorder) = connected_drone(Faults { close_control: true, ..Default::default() }).await;
        assert_disconnect_survives(drone, recorder, ShutdownStep::CloseControl).await;
    }

    #[tokio::test]
    async fn test_first_shutdown_failure_is_kept() {
        let faults = Faults { close_command: true, close_control: true, ..Default::default() };
        let (drone, _) = fake_drone(faults);
        drone.connect().await.unwrap();

        let report = drone.disconnect_with_report().await.unwrap();
        assert_eq!(report.failed, vec![ShutdownStep::CloseCommand, ShutdownStep::CloseControl]);
        let first = format!("{:#}", report.first_error.unwrap());
        assert!(first.contains("command close"), "{}", first);
    }

    #[tokio::test]
    async fn test_error_state_closes_the_link() {
        let faults = Faults { close_telemetry: true, ..Default::default() };
        let (drone, recorder) = fake_drone(faults);
        drone.connect().await.unwrap();

        drone.change_to_error_state("navdata timeout").await;

        assert_eq!(drone.state(), ConnectionState::Error);
        assert_eq!(drone.last_error().as_deref(), Some("navdata timeout"));
        assert_eq!(recorder.events(), vec!["command.close", "telemetry.close", "control.close"]);
        assert!(drone.trim().is_err());
        assert!(drone.mark_ready().is_err());

        // Already closed, entering the error state again does not close anything
        drone.change_to_error_state("again").await;
        assert_eq!(recorder.events().len(), 3);
        assert_eq!(drone.last_error().as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_bootstrap_navdata_resets_the_state() {
        let (drone, _) = fake_drone(Faults::default());
        drone.connect().await.unwrap();
        drone.mark_ready().unwrap();
        assert_eq!(drone.state(), ConnectionState::Ready);

        drone.navdata_received(NavData::new(BOOTSTRAP, 1));
        assert_eq!(drone.state(), ConnectionState::Bootstrap);
        drone.navdata_received(NavData::new(BOOTSTRAP, 2));
        assert_eq!(drone.state(), ConnectionState::Bootstrap);

        // Neither was delivered, the link was not ready when they were handled
        assert!(drone.navdata().is_empty());
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_navdata_delivered_only_when_ready() {
        let (drone, _) = fake_drone(Faults::default());

        drone.navdata_received(NavData::new(0, 1));
        drone.connect().await.unwrap();
        drone.navdata_received(NavData::new(0, 2));
        assert!(drone.navdata().is_empty());

        drone.mark_ready().unwrap();
        for sequence in 3..=5 {
            drone.navdata_received(NavData::new(0, sequence));
        }

        drone.disconnect().await;
        drone.navdata_received(NavData::new(0, 6));

        let delivered: Vec<u32> = std::iter::from_fn(|| drone.navdata().try_pop()).map(|n| n.sequence()).collect();
        assert_eq!(delivered, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_api_commands_reach_the_link() {
        let (drone, recorder) = fake_drone(Faults::default());
        drone.connect().await.unwrap();

        drone.trim().unwrap();
        wait_for_frames(&recorder, 1).await;

        drone.set_combined_yaw_mode(true);
        assert!(drone.is_combined_yaw_mode());
        drone.set(2.0, 0.0, 0.0, -0.5).unwrap();
        drone.play_animation(3, 500).unwrap();
        drone.take_off().unwrap();
        wait_for_frames(&recorder, 4).await;

        let frames = recorder.frames.lock().clone();
        assert_eq!(frames[0], "AT*FTRIM=1\r");
        assert!(frames.iter().any(|f| f.starts_with("AT*PCMD=") && f.contains(",3,1065353216,0,0,-1090519040\r")));
        assert!(frames.iter().any(|f| f.starts_with("AT*ANIM=") && f.ends_with(",3,500\r")));
        assert!(frames.iter().any(|f| f.starts_with("AT*REF=") && f.ends_with(",290718208\r")));
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_emergency_signal_only_enters_emergency() {
        let (drone, recorder) = connected_drone(Faults::default()).await;
        drone.mark_ready().unwrap();
        drone.navdata_received(NavData::new(0, 1));
        assert!(!drone.is_emergency());

        // Not in emergency, nothing to clear
        drone.clear_emergency_signal().unwrap();
        drone.send_emergency_signal().unwrap();
        wait_for_frames(&recorder, 1).await;

        drone.navdata_received(NavData::new(EMERGENCY, 2));
        assert!(drone.is_emergency());
        drone.send_emergency_signal().unwrap();
        drone.hover().unwrap();
        wait_for_frames(&recorder, 2).await;

        assert_eq!(*recorder.frames.lock(), vec!["AT*REF=1,290717952\r".to_string(), "AT*PCMD=2,0,0,0,0,0\r".to_string()]);
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_clear_emergency_signal_only_leaves_emergency() {
        let (drone, recorder) = connected_drone(Faults::default()).await;

        // Tracked in every link state, the drone reports it whatever the client does
        drone.navdata_received(NavData::new(EMERGENCY | BOOTSTRAP, 1));
        assert!(drone.is_emergency());
        drone.send_emergency_signal().unwrap();
        drone.clear_emergency_signal().unwrap();
        wait_for_frames(&recorder, 1).await;

        drone.navdata_received(NavData::new(0, 2));
        drone.clear_emergency_signal().unwrap();
        drone.hover().unwrap();
        wait_for_frames(&recorder, 2).await;

        assert_eq!(*recorder.frames.lock(), vec!["AT*REF=1,290717952\r".to_string(), "AT*PCMD=2,0,0,0,0,0\r".to_string()]);
        drone.disconnect().await;
        assert!(drone.clear_emergency_signal().is_err());
    }

    #[tokio::test]
    async fn test_demo_navigation_data_acknowledges_config() {
        let (drone, recorder) = fake_drone(Faults::default());
        drone.connect().await.unwrap();

        drone.send_demo_navigation_data().unwrap();
        wait_for_frames(&recorder, 2).await;
        assert_eq!(
            *recorder.frames.lock(),
            vec!["AT*CONFIG=1,\"general:navdata_demo\",\"TRUE\"\r".to_string(), "AT*CTRL=2,5,0\r".to_string()]
        );
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_malformed_config_option_is_rejected() {
        let (drone, recorder) = connected_drone(Faults::default()).await;

        assert!(drone.set_config_option("general:ardrone_name", "x\"\rAT*REF=1,290718208").is_err());
        assert!(drone.send(Command::configure("control:altitude_max\r", "3000")).is_err());
        drone.set_config_option("control:altitude_max", "3000").unwrap();
        wait_for_frames(&recorder, 1).await;

        assert_eq!(*recorder.frames.lock(), vec!["AT*CONFIG=1,\"control:altitude_max\",\"3000\"\r".to_string()]);
        drone.disconnect().await;
    }

    #[tokio::test]
    async fn test_quit_cannot_be_sent_by_the_application() {
        let (drone, recorder) = fake_drone(Faults::default());
        drone.connect().await.unwrap();

        assert!(drone.send(Command::Quit).is_err());
        drone.send(Command::Hover).unwrap();
        wait_for_frames(&recorder, 1).await;
        drone.disconnect().await;
    }
}
