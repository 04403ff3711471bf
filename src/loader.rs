//! Top-level driver: connects to a chip, loads an optional stub, and
//! streams data into flash or RAM.

use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::buffer::Buffer;
use crate::chip::{self, ChipFamily, Efuses};
use crate::command::{self, Command, Opcode};
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::stub::{self, Stub};
use crate::transport::Transport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const RAM_BLOCK_SIZE: u32 = 0x1800;
const CONNECT_RETRIES: u32 = 7;
const SYNC_RETRIES: u32 = 7;

/// Caller-supplied configuration for a [`Loader`].
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Size of the target's SPI flash, used when priming ESP32's flash
    /// parameters before a write.
    pub flash_size: u32,
    /// Enables extra `trace!`-level wire logging.
    pub debug: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            flash_size: 4 * 1024 * 1024,
            debug: false,
        }
    }
}

/// Drives one open serial connection through the ROM bootloader protocol.
///
/// A `Loader` is not `Sync`: it assumes a single cooperative caller driving
/// the state machine, and carries no locking beyond what the background
/// reader thread needs for itself.
pub struct Loader {
    transport: Box<dyn Transport>,
    reader: Reader,
    baud: u32,
    chip_family: Option<ChipFamily>,
    efuses: Option<Efuses>,
    is_stub: bool,
    stub: Option<Stub>,
    options: LoaderOptions,
}

impl Loader {
    /// Wrap an already-open transport. Does not touch the wire until
    /// [`Loader::connect`] is called.
    pub fn new(transport: Box<dyn Transport>, options: LoaderOptions) -> Result<Self> {
        let baud = transport.baud_rate()?;
        let reader_transport = transport.try_clone()?;
        Ok(Loader {
            transport,
            reader: Reader::new(reader_transport),
            baud,
            chip_family: None,
            efuses: None,
            is_stub: false,
            stub: None,
            options,
        })
    }

    /// Current baud rate, as last observed or set by this driver.
    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    /// Reset the chip into download mode and synchronize with its
    /// bootloader, retrying the whole reset+sync sequence up to
    /// [`CONNECT_RETRIES`] times.
    pub fn connect(&mut self) -> Result<()> {
        self.reader.start()?;
        for attempt in 0..CONNECT_RETRIES {
            debug!("connect attempt {}/{}", attempt + 1, CONNECT_RETRIES);
            if self.connect_attempt().is_ok() {
                self.reader.wait_silent(1, Duration::from_millis(200))?;
                let family = self.chip_family()?;
                info!("connected to {:?}", family);
                return Ok(());
            }
        }
        Err(Error::ConnectError)
    }

    fn connect_attempt(&mut self) -> Result<()> {
        self.reset_pulse()?;
        self.reader.wait_silent(20, Duration::from_secs(1))?;
        for _ in 0..SYNC_RETRIES {
            if self.sync_once().is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        Err(Error::ConnectError)
    }

    fn reset_pulse(&mut self) -> Result<()> {
        self.transport.set_signals(Some(false), Some(true), None)?;
        thread::sleep(Duration::from_millis(100));
        self.transport.set_signals(Some(true), Some(false), None)?;
        thread::sleep(Duration::from_millis(50));
        self.transport.set_signals(Some(false), Some(false), None)?;
        Ok(())
    }

    fn sync_once(&mut self) -> Result<()> {
        let result = self.check_command(Command::sync(), Opcode::Sync.timeout())?;
        if result.len() >= 2 && result[0] == 0 && result[1] == 0 {
            Ok(())
        } else {
            Err(Error::ConnectError)
        }
    }

    /// Register a listener, write the framed command, wait for the matching
    /// response, validate its opcode, and return `data` if present or
    /// `value` otherwise.
    fn check_command(&mut self, cmd: Command, timeout: Duration) -> Result<Vec<u8>> {
        let opcode = cmd.opcode;
        let guard = self.reader.listen()?;
        let timeout = timeout.min(Duration::from_secs(600));
        let frame = cmd.encode();
        if self.options.debug {
            trace!("-> {:02x?}", frame);
        }
        self.transport.write_all(&frame)?;
        let packet = self.reader.packet(12, timeout);
        drop(guard);
        let packet = packet?;
        if self.options.debug {
            trace!("<- {:02x?}", packet);
        }

        if packet.len() < 8 {
            return Err(Error::Timeout);
        }
        let actual = packet[1];
        if actual != opcode as u8 {
            return Err(Error::InvalidOpcodeResponse {
                expected: opcode as u8,
                actual,
            });
        }
        let value = packet[4..8].to_vec();
        let data = packet[8..].to_vec();
        if data.len() > 4 {
            Ok(data)
        } else {
            Ok(value)
        }
    }

    /// Read one 32-bit register. Exposed directly since callers driving
    /// chip-specific behavior this crate doesn't model (SPI flash
    /// parameters, clock config) need raw register access.
    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        let result = self.check_command(Command::read_reg(address), Opcode::ReadReg.timeout())?;
        let bytes: [u8; 4] = result[0..4].try_into().expect("read_reg response has 4 bytes");
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write one 32-bit register, optionally masking which bits are
    /// affected (`mask = 0xFFFFFFFF` writes the whole word).
    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32) -> Result<()> {
        self.check_command(
            Command::write_reg(address, value, mask, 0),
            Opcode::WriteReg.timeout(),
        )?;
        Ok(())
    }

    /// Read, match and cache the chip-family magic register.
    pub fn chip_family(&mut self) -> Result<ChipFamily> {
        if let Some(family) = self.chip_family {
            return Ok(family);
        }
        let magic = self.read_reg(chip::MAGIC_REG_ADDR)?;
        let family = ChipFamily::from_magic(magic)?;
        self.chip_family = Some(family);
        Ok(family)
    }

    /// Read, and cache, the four eFuse words this driver depends on.
    pub fn efuses(&mut self) -> Result<Efuses> {
        if let Some(efuses) = self.efuses {
            return Ok(efuses);
        }
        let base = self.chip_family()?.efuse_base();
        let mut efuses: Efuses = [0; 4];
        for (i, slot) in efuses.iter_mut().enumerate() {
            *slot = self.read_reg(base + (i as u32) * 4)?;
        }
        self.efuses = Some(efuses);
        Ok(efuses)
    }

    pub fn mac_addr(&mut self) -> Result<[u8; 6]> {
        let family = self.chip_family()?;
        let efuses = self.efuses()?;
        chip::mac_addr(family, efuses)
    }

    pub fn chip_name(&mut self) -> Result<&'static str> {
        let family = self.chip_family()?;
        let efuses = self.efuses()?;
        Ok(chip::chip_name(family, efuses))
    }

    fn write_size(&self, family: ChipFamily) -> u32 {
        if self.is_stub {
            0x4000
        } else if family == ChipFamily::Esp32S2 {
            0x400
        } else {
            0x200
        }
    }

    fn flash_begin(&mut self, size: u32, offset: u32, encrypted: bool) -> Result<(u32, u32)> {
        let family = self.chip_family()?;

        if matches!(family, ChipFamily::Esp32 | ChipFamily::Esp32S2) {
            self.check_command(Command::spi_attach(0), DEFAULT_TIMEOUT)?;
            if family == ChipFamily::Esp32 {
                let params = spi_set_params_payload(self.options.flash_size);
                self.check_command(Command::spi_set_params(&params), DEFAULT_TIMEOUT)?;
            }
        }

        let write_size = self.write_size(family);
        let num_blocks = size.div_ceil(write_size);
        let erase_size = if family == ChipFamily::Esp8266 {
            get_erase_size(offset, size)
        } else {
            size
        };
        let timeout = if self.is_stub {
            Opcode::FlashBegin.timeout()
        } else {
            Opcode::FlashBegin.timeout_for_size(size)
        };

        let mut payload = Buffer::new();
        payload.pack("<IIII", &[erase_size, num_blocks, write_size, offset])?;
        if family == ChipFamily::Esp32S2 {
            payload.pack("<I", &[u32::from(encrypted)])?;
        }
        let cmd = Command {
            opcode: Opcode::FlashBegin,
            payload: payload.view().to_vec(),
            checksum: 0,
        };
        self.check_command(cmd, timeout)?;
        Ok((num_blocks, write_size))
    }

    /// Write `data` to flash at `offset`, padding to the write size with
    /// `0xFF` and reporting progress via `seq`/`num_blocks` before each
    /// block write.
    pub fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        encrypted: bool,
        mut progress: impl FnMut(u32, u32),
    ) -> Result<()> {
        let pad_multiple = if encrypted { 32 } else { 4 };
        let mut padded = data.to_vec();
        let rem = padded.len() % pad_multiple;
        if rem != 0 {
            padded.resize(padded.len() + (pad_multiple - rem), 0xFF);
        }

        let (num_blocks, write_size) = self.flash_begin(padded.len() as u32, offset, encrypted)?;

        for seq in 0..num_blocks {
            let start = (seq * write_size) as usize;
            let end = usize::min(start + write_size as usize, padded.len());
            let mut block = padded[start..end].to_vec();
            if (block.len() as u32) < write_size {
                block.resize(write_size as usize, 0xFF);
            }
            progress(seq, num_blocks);
            self.check_command(Command::flash_data(&block, seq), Duration::from_millis(2000))?;
        }

        if self.is_stub {
            self.read_reg(chip::MAGIC_REG_ADDR)?;
        }
        Ok(())
    }

    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        self.flash_begin(0, 0, false)?;
        self.check_command(Command::flash_end(reboot), DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, offset: u32) -> Result<()> {
        if self.is_stub {
            if let Some(stub) = &self.stub {
                if stub.overlaps(offset, size) {
                    return Err(Error::StubOverlap);
                }
            }
        }
        self.check_command(Command::mem_begin(size, blocks, block_size, offset), DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn mem_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        self.check_command(Command::mem_data(data, seq), DEFAULT_TIMEOUT)?;
        Ok(())
    }

    /// Send `MEM_END`. Under the ROM bootloader the chip typically jumps to
    /// the entry point before it can reply, so a failure here is swallowed;
    /// under a loaded stub it is a genuine protocol error and propagates.
    pub fn mem_finish(&mut self, entry: u32) -> Result<()> {
        let result = self.check_command(Command::mem_end(entry), Opcode::MemEnd.timeout());
        if self.is_stub {
            result.map(|_| ())
        } else {
            Ok(())
        }
    }

    fn upload_segment(&mut self, data: &[u8], start: u32, block_size: u32) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let num_blocks = (data.len() as u32).div_ceil(block_size);
        self.mem_begin(data.len() as u32, num_blocks, block_size, start)?;
        for seq in 0..num_blocks {
            let s = (seq * block_size) as usize;
            let e = usize::min(s + block_size as usize, data.len());
            self.mem_block(&data[s..e], seq)?;
        }
        Ok(())
    }

    /// Upload a RAM stub and jump to its entry point, expecting the
    /// `"OHAI"` handshake in reply. Only ESP32 has a built-in default stub;
    /// every other family requires `stub` to be `Some`.
    pub fn load_stub(&mut self, stub: Option<Stub>) -> Result<()> {
        let family = self.chip_family()?;
        let stub = match stub {
            Some(stub) => stub,
            None => Stub::for_family(family)?,
        };

        self.upload_segment(&stub.text, stub.text_start, RAM_BLOCK_SIZE)?;
        self.upload_segment(&stub.data, stub.data_start, RAM_BLOCK_SIZE)?;

        let guard = self.reader.listen()?;
        let cmd = Command::mem_end(stub.entry);
        self.transport.write_all(&cmd.encode())?;
        let packet = self.reader.packet(4, Duration::from_secs(1));
        drop(guard);
        let packet = packet?;

        if !packet.windows(stub::HANDSHAKE.len()).any(|w| w == stub::HANDSHAKE) {
            return Err(Error::StubStartFailed);
        }

        info!("stub running");
        self.is_stub = true;
        self.chip_family = None;
        self.efuses = None;
        self.stub = Some(stub);
        Ok(())
    }

    /// Change the wire baud rate. Valid at any point between commands.
    pub fn set_baud_rate(&mut self, new_baud: u32) -> Result<()> {
        let prior_baud = if self.is_stub { self.baud } else { 0 };
        self.check_command(
            Command::change_baudrate(new_baud, prior_baud),
            Opcode::ChangeBaudrate.timeout(),
        )?;

        self.reader.stop();
        self.transport.set_baud_rate(new_baud)?;
        self.reader.start()?;
        self.reader.wait_silent(10, Duration::from_millis(200))?;
        self.baud = new_baud;
        debug!("baud rate changed to {new_baud}");
        Ok(())
    }

    /// Stop the background reader. The transport itself stays open and
    /// owned by the caller; only the reader's thread is torn down.
    pub fn disconnect(&mut self) -> Option<Error> {
        self.reader.stop()
    }

    /// Erase the entire flash chip. Only implemented by the stub loader.
    pub fn erase_flash(&mut self) -> Result<()> {
        if !self.is_stub {
            warn!("erase_flash called without a loaded stub; the ROM bootloader does not implement it");
        }
        self.check_command(Command::erase_flash(), Duration::from_secs(300))?;
        Ok(())
    }
}

/// ESP8266 ROM bootloader erase-size workaround: the ROM erases in whole
/// 16-sector blocks, so a write that starts mid-block needs its announced
/// erase size adjusted or the tail of the prior block gets clobbered.
pub fn get_erase_size(offset: u32, size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    let sector_size = command::FLASH_SECTOR_SIZE;
    let sectors_per_block = 16u32;

    let num_sectors = size.div_ceil(sector_size);
    let start_sector = offset / sector_size;
    let head_sectors = (sectors_per_block - (start_sector % sectors_per_block)).min(num_sectors);

    if num_sectors < 2 * head_sectors {
        (num_sectors + 1) / 2 * sector_size
    } else {
        (num_sectors - head_sectors) * sector_size
    }
}

fn spi_set_params_payload(flash_size: u32) -> [u8; 24] {
    let mut buf = Buffer::new();
    buf.pack("<IIIIII", &[0, flash_size, 0x10000, 4096, 256, 0xFFFF])
        .expect("fixed-arity pack cannot mismatch");
    let mut out = [0u8; 24];
    out.copy_from_slice(buf.view());
    out
}
