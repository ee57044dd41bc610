//! C ABI for linking repeater-core as a static library from Android (NDK) or other C/C++ hosts.
//! The JNI shim calls these from C. Clients are addressed by opaque `u64` handles;
//! a released handle is never reused with the same value.
//!
//! All functions return `status::*` codes; send/recv return byte counts on success.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::slice;
use std::sync::{Arc, Mutex, OnceLock};

use crate::client::{self, RepeaterClient};
use crate::config::ClientConfig;
use crate::keystore::KeyStore;
use crate::runtime;
use crate::status::{self, to_status, StatusCode};

struct Slot {
    generation: u32,
    client: Option<Arc<RepeaterClient>>,
}

/// Handle = generation << 32 | slot index. Generations start at 1, so 0 is never valid.
struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl HandleTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, client: Arc<RepeaterClient>) -> u64 {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    client: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.client = Some(client);
        (u64::from(slot.generation) << 32) | index as u64
    }

    fn slot_mut(&mut self, handle: u64) -> Option<&mut Slot> {
        let generation = (handle >> 32) as u32;
        let index = (handle & 0xFFFF_FFFF) as usize;
        self.slots
            .get_mut(index)
            .filter(|s| s.generation == generation && s.client.is_some())
    }

    fn get(&mut self, handle: u64) -> Option<Arc<RepeaterClient>> {
        self.slot_mut(handle).and_then(|s| s.client.clone())
    }

    fn remove(&mut self, handle: u64) -> Option<Arc<RepeaterClient>> {
        let slot = self.slot_mut(handle)?;
        let client = slot.client.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push((handle & 0xFFFF_FFFF) as usize);
        client
    }
}

static HANDLES: Mutex<HandleTable> = Mutex::new(HandleTable::new());
static LAST_BINDING: OnceLock<Arc<KeyStore>> = OnceLock::new();

/// Key store shared by every client created through this ABI.
fn last_binding() -> &'static Arc<KeyStore> {
    LAST_BINDING.get_or_init(|| Arc::new(KeyStore::new()))
}

fn handles() -> std::sync::MutexGuard<'static, HandleTable> {
    HANDLES.lock().unwrap_or_else(|e| e.into_inner())
}

fn lookup(handle: u64) -> Result<Arc<RepeaterClient>, c_int> {
    handles().get(handle).ok_or(status::NOT_INITIALIZED)
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn bytes<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if ptr.is_null() {
        return None;
    }
    Some(slice::from_raw_parts(ptr, len))
}

fn copy_out(src: Option<Vec<u8>>, out: *mut u8, cap: usize) -> c_int {
    let Some(src) = src else {
        return 0;
    };
    if out.is_null() || cap < src.len() {
        return status::INVALID_ARGUMENT;
    }
    unsafe {
        out.copy_from_nonoverlapping(src.as_ptr(), src.len());
    }
    src.len() as c_int
}

/// Start logging and the shared runtime. Idempotent; returns 0 or -1.
#[no_mangle]
pub extern "C" fn repeater_init() -> c_int {
    match runtime::init() {
        Ok(()) => status::OK,
        Err(_) => status::FAILURE,
    }
}

/// Create a client for `ip:port`. Returns a handle, or 0 on invalid input.
#[no_mangle]
pub extern "C" fn repeater_client_init(ip: *const c_char, port: u32) -> u64 {
    let Some(ip) = (unsafe { c_str(ip) }) else {
        return 0;
    };
    match RepeaterClient::with_key_store(ip, port, ClientConfig::default(), last_binding().clone()) {
        Ok(client) => handles().insert(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "client init failed");
            0
        }
    }
}

#[no_mangle]
pub extern "C" fn repeater_client_connect(handle: u64) -> c_int {
    let client = match lookup(handle) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match client.connect() {
        Ok(()) => status::OK,
        Err(e) => e.status_code(),
    }
}

/// Send `len` bytes. Returns bytes sent or a negative status.
#[no_mangle]
pub extern "C" fn repeater_client_send(handle: u64, data: *const u8, len: usize) -> c_int {
    let client = match lookup(handle) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let Some(data) = (unsafe { bytes(data, len) }) else {
        return status::INVALID_ARGUMENT;
    };
    to_status(client.send(data))
}

/// Block until one message arrives; writes at most `cap` bytes to `out`.
/// Returns bytes written or a negative status.
#[no_mangle]
pub extern "C" fn repeater_client_recv(handle: u64, out: *mut u8, cap: usize) -> c_int {
    let client = match lookup(handle) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if out.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let cap = cap.min(i32::MAX as usize);
    let buf = unsafe { slice::from_raw_parts_mut(out, cap) };
    to_status(client.receive_into(buf))
}

/// Release the client. Unblocks a pending recv on another thread. Safe to
/// call twice; unknown handles are ignored. The last binding stays in place
/// for the other handles.
#[no_mangle]
pub extern "C" fn repeater_client_release(handle: u64) {
    let removed = handles().remove(handle);
    if let Some(client) = removed {
        client.release();
    }
}

/// Bind the device `mac_6` through the repeater at `ip`. On success the key
/// material is visible to every client and to `repeater_last_aes_*`.
#[no_mangle]
pub extern "C" fn repeater_bind_device(
    ip: *const c_char,
    mac_6: *const u8,
    master: *const u8,
    master_len: usize,
    key: *const u8,
    key_len: usize,
) -> c_int {
    let (Some(ip), Some(mac), Some(master), Some(key)) = (unsafe {
        (
            c_str(ip),
            bytes(mac_6, 6),
            bytes(master, master_len),
            bytes(key, key_len),
        )
    }) else {
        return status::INVALID_ARGUMENT;
    };
    match client::bind_device(ip, mac, master, key, &ClientConfig::default()) {
        Ok(material) => {
            last_binding().set(material);
            status::OK
        }
        Err(e) => e.status_code(),
    }
}

/// Copy the last bound key into `out`. Returns its length, 0 if nothing is
/// bound, or -7 if `cap` is too small.
#[no_mangle]
pub extern "C" fn repeater_last_aes_key(out: *mut u8, cap: usize) -> c_int {
    copy_out(
        last_binding().get().map(|m| m.key().as_bytes().to_vec()),
        out,
        cap,
    )
}

/// Copy the last bound IV (16 bytes) into `out`; same returns as the key.
#[no_mangle]
pub extern "C" fn repeater_last_aes_iv(out: *mut u8, cap: usize) -> c_int {
    copy_out(last_binding().get().map(|m| m.iv().to_vec()), out, cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_iv, AesKey, KeyMaterial};
    use crate::identity::MacAddr;
    use crate::protocol::{FrameType, DEFAULT_BIND_PORT, DEFAULT_MAX_PAYLOAD};
    use crate::wire::decode_frame;
    use crate::server::{DeviceRegistry, RepeaterServer};
    use std::ffi::CString;

    // tests here share the process-wide key store
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn handle_table_rejects_stale_handles() {
        let mut table = HandleTable::new();
        let client = Arc::new(RepeaterClient::init("127.0.0.1", 9).unwrap());
        let a = table.insert(client.clone());
        assert_ne!(a, 0);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        let b = table.insert(client);
        assert_ne!(a, b);
        assert_eq!(a & 0xFFFF_FFFF, b & 0xFFFF_FFFF);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn client_lifecycle_codes() {
        let _guard = serial();
        assert_eq!(repeater_init(), status::OK);
        assert_eq!(repeater_client_init(std::ptr::null(), 80), 0);
        let empty = CString::new("").unwrap();
        assert_eq!(repeater_client_init(empty.as_ptr(), 80), 0);

        let ip = CString::new("127.0.0.1").unwrap();
        let h = repeater_client_init(ip.as_ptr(), 9);
        assert_ne!(h, 0);
        let data = b"hi";
        assert_eq!(
            repeater_client_send(h, data.as_ptr(), data.len()),
            status::NOT_CONNECTED
        );
        assert_eq!(repeater_client_send(h, std::ptr::null(), 2), status::INVALID_ARGUMENT);
        let mut buf = [0u8; 8];
        assert_eq!(
            repeater_client_recv(h, buf.as_mut_ptr(), buf.len()),
            status::NOT_CONNECTED
        );

        repeater_client_release(h);
        repeater_client_release(h);
        assert_eq!(repeater_client_connect(h), status::NOT_INITIALIZED);
        assert_eq!(
            repeater_client_send(h, data.as_ptr(), data.len()),
            status::NOT_INITIALIZED
        );
        assert_eq!(repeater_client_connect(0), status::NOT_INITIALIZED);
    }

    #[test]
    fn releasing_one_handle_keeps_peers_encrypted() {
        let _guard = serial();
        let rt = runtime::runtime().unwrap();
        let listener = rt
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = u32::from(listener.local_addr().unwrap().port());
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        rt.spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let _ = stream.read_to_end(&mut seen).await;
            let _ = seen_tx.send(seen);
        });

        let ip = CString::new("127.0.0.1").unwrap();
        let h1 = repeater_client_init(ip.as_ptr(), port);
        let h2 = repeater_client_init(ip.as_ptr(), port);
        let km = KeyMaterial::new(
            AesKey::Aes128([0x07; 16]),
            generate_iv(),
            MacAddr([1, 2, 3, 4, 5, 6]),
        );
        last_binding().set(km.clone());
        assert_eq!(repeater_client_connect(h2), status::OK);

        repeater_client_release(h1);
        assert!(last_binding().is_set());
        let data = b"PING";
        assert_eq!(repeater_client_send(h2, data.as_ptr(), data.len()), 4);

        // once the store is emptied the connected handle refuses, never plaintext
        last_binding().clear();
        assert_eq!(
            repeater_client_send(h2, data.as_ptr(), data.len()),
            status::KEY_UNAVAILABLE
        );
        repeater_client_release(h2);

        let seen = seen_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        let (frame, used) = decode_frame(&seen, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(used, seen.len());
        assert_eq!(frame.frame_type(), Ok(FrameType::Data));
        assert_eq!(km.decrypt(&frame.payload).unwrap(), b"PING");
    }

    #[test]
    fn bind_fills_last_binding() {
        let _guard = serial();
        let rt = runtime::runtime().unwrap();
        // the default config binds on the well-known port; skipped (with a
        // message) if it is taken
        let registry = Arc::new(DeviceRegistry::new());
        let mac = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
        registry.provision(MacAddr(mac), AesKey::Aes128([0x05; 16]));
        let server = match rt.block_on(RepeaterServer::bind(("127.0.0.1", DEFAULT_BIND_PORT), registry)) {
            Ok(s) => s,
            Err(e) => {
                eprintln!(
                    "skipping bind_fills_last_binding: port {} unavailable: {}",
                    DEFAULT_BIND_PORT, e
                );
                return;
            }
        };
        let task = rt.spawn(server.serve());

        last_binding().clear();
        let mut buf = [0u8; 32];
        assert_eq!(repeater_last_aes_key(buf.as_mut_ptr(), buf.len()), 0);

        let ip = CString::new("127.0.0.1").unwrap();
        let master = [0u8; 16];
        let key = [0x05u8; 16];
        assert_eq!(
            repeater_bind_device(ip.as_ptr(), mac.as_ptr(), master.as_ptr(), 16, key.as_ptr(), 16),
            status::OK
        );
        assert_eq!(repeater_last_aes_key(buf.as_mut_ptr(), buf.len()), 16);
        assert_eq!(&buf[..16], &key);
        assert_eq!(repeater_last_aes_iv(buf.as_mut_ptr(), 4), status::INVALID_ARGUMENT);
        assert_eq!(repeater_last_aes_iv(buf.as_mut_ptr(), buf.len()), 16);

        assert_eq!(
            repeater_bind_device(ip.as_ptr(), std::ptr::null(), master.as_ptr(), 16, key.as_ptr(), 16),
            status::INVALID_ARGUMENT
        );
        task.abort();
        last_binding().clear();
    }
}
