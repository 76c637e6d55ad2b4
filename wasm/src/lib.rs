use chirpdrop_core::{
    encode_frame, extract_frame_fields, localize_description, parse_sdp, write_sdp, DataChannel,
    FileReceiver, FileSender, FrameInbox, FrameKind, Modem, ModemProgress, PeerConnection,
    PeerFactory, PeerRole, ReceiveEvent, SendStep, SessionDescription, SignalEvent,
    SignalingError, SignalingFrame, SignalingSession, SignalingState,
};
use js_sys::{Array, Date, Function, Object, Reflect, Uint8Array};
use std::io::Cursor;
use std::net::Ipv4Addr;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{console, RtcDataChannel};

fn to_js(e: SignalingError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn parse_kind(kind: &str) -> Result<FrameKind, JsValue> {
    match kind {
        "offer" => Ok(FrameKind::Offer),
        "answer" => Ok(FrameKind::Answer),
        other => Err(JsValue::from_str(&format!("Unknown description type '{}'", other))),
    }
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr, JsValue> {
    ip.parse()
        .map_err(|_| JsValue::from_str(&format!("Invalid IPv4 address '{}'", ip)))
}

fn set(target: &Object, key: &str, value: JsValue) -> Result<(), JsValue> {
    Reflect::set(target, &JsValue::from_str(key), &value).map(|_| ())
}

fn now_ms() -> u64 {
    Date::now() as u64
}

/// Rewrite a freshly created offer/answer before `setLocalDescription`
#[wasm_bindgen(js_name = localizeDescription)]
pub fn localize(kind: &str, sdp: &str, local_ip: &str) -> Result<String, JsValue> {
    let kind = parse_kind(kind)?;
    let mut descriptor = parse_sdp(sdp).map_err(to_js)?;
    localize_description(&mut descriptor, kind, parse_ip(local_ip)?);
    Ok(write_sdp(&descriptor))
}

/// Compress the gathered local description into the 256 bytes the modem sends
#[wasm_bindgen(js_name = encodeLocalDescription)]
pub fn encode_local_description(kind: &str, sdp: &str, local_ip: &str) -> Result<Vec<u8>, JsValue> {
    let descriptor = parse_sdp(sdp).map_err(to_js)?;
    let fields =
        extract_frame_fields(&descriptor, parse_kind(kind)?, parse_ip(local_ip)?).map_err(to_js)?;
    let frame = encode_frame(&fields).map_err(to_js)?;
    Ok(frame.to_vec())
}

/// Turns decoded modem output into `{type, sdp, ip, port}` once per frame
#[wasm_bindgen]
pub struct WasmFrameInbox {
    inner: FrameInbox,
}

#[wasm_bindgen]
impl WasmFrameInbox {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Result<WasmFrameInbox, JsValue> {
        FrameInbox::new()
            .map(|inbox| WasmFrameInbox { inner: inbox })
            .map_err(to_js)
    }

    /// Returns `null` for repeats, silence and malformed frames
    pub fn process(&mut self, data: &[u8]) -> Result<JsValue, JsValue> {
        let event = match self.inner.process(data) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(JsValue::NULL),
            Err(SignalingError::MalformedFrame(reason)) => {
                console::debug_1(&JsValue::from_str(&format!("Dropping frame: {}", reason)));
                return Ok(JsValue::NULL);
            }
            Err(e) => return Err(to_js(e)),
        };

        let description = Object::new();
        set(&description, "type", JsValue::from_str(event.kind().sdp_type()))?;
        set(&description, "sdp", JsValue::from_str(&event.description.sdp))?;
        set(&description, "ip", JsValue::from_str(&event.fields.ip.to_string()))?;
        set(&description, "port", JsValue::from(event.fields.port))?;
        Ok(description.into())
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

struct BrowserChannel<'a>(&'a RtcDataChannel);

impl DataChannel for BrowserChannel<'_> {
    fn send(&mut self, data: &[u8]) -> chirpdrop_core::Result<()> {
        self.0
            .send_with_u8_array(data)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    fn buffered_amount(&self) -> usize {
        self.0.buffered_amount() as usize
    }

    fn close(&mut self) {
        self.0.close();
    }
}

/// Streams an in-memory file over an open `RTCDataChannel`
#[wasm_bindgen]
pub struct WasmFileSender {
    inner: FileSender<Cursor<Vec<u8>>>,
}

#[wasm_bindgen]
impl WasmFileSender {
    #[wasm_bindgen(constructor)]
    pub fn new(name: String, data: Vec<u8>) -> Result<WasmFileSender, JsValue> {
        let size = data.len() as u64;
        FileSender::new(name, size, Cursor::new(data))
            .map(|sender| WasmFileSender { inner: sender })
            .map_err(to_js)
    }

    pub fn start(&mut self, channel: &RtcDataChannel) -> Result<(), JsValue> {
        self.inner
            .start(&mut BrowserChannel(channel))
            .map_err(to_js)
    }

    /// Milliseconds to wait before the next call, or -1 once everything is
    /// sent and the channel is closed
    #[wasm_bindgen(js_name = pollSend)]
    pub fn poll_send(&mut self, channel: &RtcDataChannel) -> Result<f64, JsValue> {
        match self
            .inner
            .poll_send(&mut BrowserChannel(channel))
            .map_err(to_js)?
        {
            SendStep::Sent { .. } => Ok(0.0),
            SendStep::Deferred { retry_after } => Ok(retry_after.as_millis() as f64),
            SendStep::Complete { .. } => Ok(-1.0),
        }
    }

    #[wasm_bindgen(getter, js_name = bytesSent)]
    pub fn bytes_sent(&self) -> f64 {
        self.inner.bytes_sent() as f64
    }
}

#[wasm_bindgen]
pub struct WasmFileReceiver {
    inner: FileReceiver,
}

#[wasm_bindgen]
impl WasmFileReceiver {
    #[wasm_bindgen(constructor)]
    pub fn new() -> WasmFileReceiver {
        WasmFileReceiver {
            inner: FileReceiver::new(now_ms()),
        }
    }

    /// Feed one `message` event; resolves to `{name, data}` on the last
    /// chunk, after closing `channel`
    #[wasm_bindgen(js_name = onMessage)]
    pub fn on_message(&mut self, channel: &RtcDataChannel, data: &[u8]) -> Result<JsValue, JsValue> {
        match self
            .inner
            .receive(&mut BrowserChannel(channel), data)
            .map_err(to_js)?
        {
            ReceiveEvent::Complete(file) => {
                let summary = self.inner.summary(now_ms());
                console::log_1(&JsValue::from_str(&format!(
                    "Received '{}': {} bytes, average {} kbit/s, peak {} kbit/s",
                    file.name, summary.bytes, summary.average_kbps, summary.max_kbps
                )));

                let result = Object::new();
                set(&result, "name", JsValue::from_str(&file.name))?;
                set(&result, "data", Uint8Array::from(file.data.as_slice()).into())?;
                Ok(result.into())
            }
            _ => Ok(JsValue::NULL),
        }
    }

    /// Bitrate since the previous call, for a 500 ms timer
    #[wasm_bindgen(js_name = sampleBitrate)]
    pub fn sample_bitrate(&mut self) -> Option<f64> {
        self.inner.sample_bitrate(now_ms()).map(|kbps| kbps as f64)
    }

    #[wasm_bindgen(getter)]
    pub fn received(&self) -> f64 {
        self.inner.received() as f64
    }

    #[wasm_bindgen(getter)]
    pub fn size(&self) -> Option<f64> {
        self.inner.size().map(|size| size as f64)
    }
}

impl Default for WasmFileReceiver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_role(role: &str) -> Result<PeerRole, JsValue> {
    match role {
        "sender" => Ok(PeerRole::Sender),
        "receiver" => Ok(PeerRole::Receiver),
        other => Err(JsValue::from_str(&format!("Unknown peer role '{}'", other))),
    }
}

fn role_name(role: PeerRole) -> &'static str {
    match role {
        PeerRole::Sender => "sender",
        PeerRole::Receiver => "receiver",
    }
}

fn peer_error(e: JsValue) -> SignalingError {
    SignalingError::Peer(e.as_string().unwrap_or_else(|| format!("{:?}", e)))
}

/// Call `target[name](...args)`
fn call_hook(target: &JsValue, name: &str, args: &[JsValue]) -> Result<JsValue, JsValue> {
    let function: Function = Reflect::get(target, &JsValue::from_str(name))?
        .dyn_into()
        .map_err(|_| JsValue::from_str(&format!("Hook '{}' is not a function", name)))?;
    let array = Array::new();
    for arg in args {
        array.push(arg);
    }
    function.apply(target, &array)
}

fn description_to_js(description: &SessionDescription) -> Result<JsValue, JsValue> {
    let object = Object::new();
    set(&object, "type", JsValue::from_str(description.kind.sdp_type()))?;
    set(&object, "sdp", JsValue::from_str(&description.sdp))?;
    Ok(object.into())
}

/// An `RTCPeerConnection` wrapper living on the JS side
struct JsPeer {
    hooks: JsValue,
}

impl JsPeer {
    fn call(&self, name: &str, args: &[JsValue]) -> chirpdrop_core::Result<()> {
        call_hook(&self.hooks, name, args)
            .map(|_| ())
            .map_err(peer_error)
    }
}

impl PeerConnection for JsPeer {
    fn create_data_channel(&mut self, label: &str) -> chirpdrop_core::Result<()> {
        self.call("createDataChannel", &[JsValue::from_str(label)])
    }

    fn create_offer(&mut self) -> chirpdrop_core::Result<()> {
        self.call("createOffer", &[])
    }

    fn create_answer(&mut self) -> chirpdrop_core::Result<()> {
        self.call("createAnswer", &[])
    }

    fn set_local_description(&mut self, description: &SessionDescription) -> chirpdrop_core::Result<()> {
        let description = description_to_js(description).map_err(peer_error)?;
        self.call("setLocalDescription", &[description])
    }

    fn set_remote_description(&mut self, description: &SessionDescription) -> chirpdrop_core::Result<()> {
        let description = description_to_js(description).map_err(peer_error)?;
        self.call("setRemoteDescription", &[description])
    }

    fn close(&mut self) {
        if let Err(e) = self.call("close", &[]) {
            console::warn_1(&JsValue::from_str(&e.to_string()));
        }
    }
}

/// `hooks.createPeer(role)` returns the object backing each [`JsPeer`]
struct JsPeerFactory {
    hooks: JsValue,
}

impl PeerFactory for JsPeerFactory {
    type Peer = JsPeer;

    fn create(&mut self, role: PeerRole) -> chirpdrop_core::Result<JsPeer> {
        let hooks = call_hook(&self.hooks, "createPeer", &[JsValue::from_str(role_name(role))])
            .map_err(peer_error)?;
        Ok(JsPeer { hooks })
    }
}

/// The modem as `{transmit(frame), decodedBytes(), progress()}`
struct JsModem {
    hooks: JsValue,
}

fn progress_field(progress: &JsValue, key: &str) -> i32 {
    Reflect::get(progress, &JsValue::from_str(key))
        .ok()
        .and_then(|value| value.as_f64())
        .map_or(0, |value| value as i32)
}

impl Modem for JsModem {
    fn transmit(&mut self, frame: &SignalingFrame) -> chirpdrop_core::Result<()> {
        let bytes = Uint8Array::from(frame.as_bytes().as_slice());
        call_hook(&self.hooks, "transmit", &[bytes.into()])
            .map(|_| ())
            .map_err(peer_error)
    }

    fn decoded_bytes(&mut self) -> Option<Vec<u8>> {
        call_hook(&self.hooks, "decodedBytes", &[])
            .ok()
            .and_then(|value| value.dyn_into::<Uint8Array>().ok())
            .map(|array| array.to_vec())
    }

    fn progress(&self) -> ModemProgress {
        match call_hook(&self.hooks, "progress", &[]) {
            Ok(progress) => ModemProgress {
                frames_left_to_record: progress_field(&progress, "framesLeftToRecord"),
                frames_to_record: progress_field(&progress, "framesToRecord"),
                frames_left_to_analyze: progress_field(&progress, "framesLeftToAnalyze"),
                frames_to_analyze: progress_field(&progress, "framesToAnalyze"),
            },
            Err(_) => ModemProgress::default(),
        }
    }
}

fn event_to_js(event: &SignalEvent) -> Result<JsValue, JsValue> {
    let object = Object::new();
    let (kind, from) = match event {
        SignalEvent::OfferReceived { from } => ("offerReceived", Some(from)),
        SignalEvent::AnswerApplied { from } => ("answerApplied", Some(from)),
        SignalEvent::AnswerNotAddressed { from } => ("answerNotAddressed", Some(from)),
        SignalEvent::DecodeFailed => ("decodeFailed", None),
        SignalEvent::Failed(message) => {
            set(&object, "message", JsValue::from_str(message))?;
            ("failed", None)
        }
    };
    set(&object, "type", JsValue::from_str(kind))?;
    if let Some(from) = from {
        set(&object, "from", JsValue::from_str(&from.to_string()))?;
    }
    Ok(object.into())
}

/// The offer/answer state machine, with the peer connection and modem
/// supplied as JS callback objects.
///
/// `peers.createPeer(role)` must return an object with `createDataChannel`,
/// `createOffer`, `createAnswer`, `setLocalDescription`,
/// `setRemoteDescription` and `close`. Their results are reported back
/// through `onLocalDescription` and `onIceGatheringComplete`.
#[wasm_bindgen]
pub struct WasmSignalingSession {
    inner: SignalingSession<JsPeerFactory, JsModem>,
}

#[wasm_bindgen]
impl WasmSignalingSession {
    #[wasm_bindgen(constructor)]
    pub fn new(peers: JsValue, modem: JsValue, local_ip: &str) -> Result<WasmSignalingSession, JsValue> {
        let local_ip = parse_ip(local_ip)?;
        SignalingSession::new(JsPeerFactory { hooks: peers }, JsModem { hooks: modem }, local_ip)
            .map(|session| WasmSignalingSession { inner: session })
            .map_err(to_js)
    }

    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        match self.inner.state() {
            SignalingState::Idle => "idle",
            SignalingState::OfferPending => "offerPending",
            SignalingState::AwaitingAnswer => "awaitingAnswer",
            SignalingState::OfferReceived => "offerReceived",
            SignalingState::AnswerPending => "answerPending",
            SignalingState::Connected => "connected",
        }
        .to_string()
    }

    #[wasm_bindgen(js_name = setLocalIp)]
    pub fn set_local_ip(&mut self, local_ip: &str) -> Result<(), JsValue> {
        self.inner.set_local_ip(parse_ip(local_ip)?);
        Ok(())
    }

    /// `{type, sdp}` of the offer waiting for `acceptOffer`, or `null`
    #[wasm_bindgen(getter, js_name = pendingOffer)]
    pub fn pending_offer(&self) -> Result<JsValue, JsValue> {
        match self.inner.pending_offer() {
            Some(offer) => description_to_js(offer),
            None => Ok(JsValue::NULL),
        }
    }

    #[wasm_bindgen(js_name = startSender)]
    pub fn start_sender(&mut self) -> Result<(), JsValue> {
        self.inner.start_sender().map_err(to_js)
    }

    #[wasm_bindgen(js_name = onLocalDescription)]
    pub fn on_local_description(&mut self, role: &str, sdp: &str) -> Result<(), JsValue> {
        let role = parse_role(role)?;
        self.inner.on_local_description(role, sdp).map_err(to_js)
    }

    /// Returns the frame handed to the modem
    #[wasm_bindgen(js_name = onIceGatheringComplete)]
    pub fn on_ice_gathering_complete(&mut self, role: &str, sdp: &str) -> Result<Vec<u8>, JsValue> {
        let role = parse_role(role)?;
        self.inner
            .on_ice_gathering_complete(role, sdp)
            .map(|frame| frame.to_vec())
            .map_err(to_js)
    }

    #[wasm_bindgen(js_name = acceptOffer)]
    pub fn accept_offer(&mut self) -> Result<(), JsValue> {
        self.inner.accept_offer().map_err(to_js)
    }

    /// Run from a timer; returns the events raised since the last call
    #[wasm_bindgen(js_name = pollModem)]
    pub fn poll_modem(&mut self) -> Result<Array, JsValue> {
        let events = Array::new();
        for event in self.inner.poll_modem() {
            events.push(&event_to_js(&event)?);
        }
        Ok(events)
    }

    #[wasm_bindgen(js_name = onSendChannelOpen)]
    pub fn on_send_channel_open(&self) -> Result<(), JsValue> {
        self.inner.on_send_channel_open().map_err(to_js)
    }

    /// Whether an incoming `datachannel` event should be read
    #[wasm_bindgen(js_name = onIncomingChannel)]
    pub fn on_incoming_channel(&mut self) -> bool {
        self.inner.on_incoming_channel()
    }

    #[wasm_bindgen(js_name = onTransferComplete)]
    pub fn on_transfer_complete(&mut self) {
        self.inner.on_transfer_complete();
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}
