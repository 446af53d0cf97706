//! NES cartridges: the iNES file format and mapper implementations.

use std::cell::RefCell;
use std::rc::Rc;

/// Size of a PRG ROM bank.
pub const PRG_BANK_SIZE: usize = 16384;

/// Size of a CHR ROM bank.
pub const CHR_BANK_SIZE: usize = 8192;

/// Size of the trainer blob some dumps carry before their banks.
const TRAINER_SIZE: usize = 512;

/// Name-table mirroring modes, controlled by the cartridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mirroring {
    /// All four name tables map to the first one.
    Single,
    /// Name tables 2, 3 map to 0, 1.
    Horizontal,
    /// Name tables 1, 3 map to 0, 2.
    Vertical,
    /// Four independent name tables (extra VRAM on the cartridge).
    Four,
}

/// A parsed iNES ROM image.
#[derive(Clone, Debug)]
pub struct InesFile {
    prg_banks: Vec<Vec<u8>>,
    chr_banks: Vec<Vec<u8>>,
    mapper_id: u8,
    ram_banks: u8,
    vertical_mirroring: bool,
    battery_ram: bool,
    four_screen: bool,
    pal: bool,
}

impl InesFile {
    /// Parses a `.nes` image.
    pub fn load(data: &[u8]) -> Result<Self, String> {
        if data.len() < 16 {
            return Err("File too small".to_string());
        }

        if &data[0..4] != b"NES\x1A" {
            return Err("Invalid magic".to_string());
        }

        let prg_count = data[4] as usize;
        let chr_count = data[5] as usize;
        let flags1 = data[6];
        let flags2 = data[7];
        let ram_banks = data[8];
        let flags3 = data[9];
        // Bytes 10..=15 are reserved.

        let mapper_id = (flags1 >> 4) | (flags2 & 0xF0);
        let has_trainer = flags1 & 0x04 != 0;

        let mut offset = 16;
        if has_trainer {
            offset += TRAINER_SIZE;
        }

        let mut read_banks = |count: usize, size: usize| -> Result<Vec<Vec<u8>>, String> {
            let mut banks = Vec::with_capacity(count);
            for _ in 0..count {
                let end = offset + size;
                let bank = data.get(offset..end).ok_or("File too small")?;
                banks.push(bank.to_vec());
                offset = end;
            }
            Ok(banks)
        };

        let prg_banks = read_banks(prg_count, PRG_BANK_SIZE)?;
        let chr_banks = read_banks(chr_count, CHR_BANK_SIZE)?;

        Ok(Self {
            prg_banks,
            chr_banks,
            mapper_id,
            ram_banks: ram_banks.max(1),
            vertical_mirroring: flags1 & 0x01 != 0,
            battery_ram: flags1 & 0x02 != 0,
            four_screen: flags1 & 0x08 != 0,
            pal: flags3 & 0x01 != 0,
        })
    }

    pub fn mapper_id(&self) -> u8 {
        self.mapper_id
    }

    pub fn prg_banks(&self) -> &[Vec<u8>] {
        &self.prg_banks
    }

    pub fn chr_banks(&self) -> &[Vec<u8>] {
        &self.chr_banks
    }

    pub fn ram_banks(&self) -> u8 {
        self.ram_banks
    }

    pub fn has_battery_ram(&self) -> bool {
        self.battery_ram
    }

    pub fn is_pal(&self) -> bool {
        self.pal
    }

    /// Mirroring as requested by the header.
    pub fn mirroring(&self) -> Mirroring {
        if self.four_screen {
            Mirroring::Four
        } else if self.vertical_mirroring {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        }
    }
}

/// Cartridge banking logic behind the CPU and PPU buses.
///
/// `tag` is the contract that makes function caching sound: any bank switch
/// or RAM write that could change what the CPU sees behind an address must
/// change the returned fingerprint.
pub trait Mapper {
    /// Human-readable board name.
    fn name(&self) -> &'static str;

    /// Fingerprint of the visible configuration.
    fn tag(&self) -> u64;

    /// Read from CPU space (`$4018..$FFFF`).
    fn read(&mut self, address: u16) -> u8;

    /// Write into CPU space.
    fn write(&mut self, address: u16, value: u8);

    /// Read from the pattern-table bus (`$0000..$1FFF`).
    fn read_chr(&mut self, address: u16) -> u8;

    /// Write into the pattern-table bus (CHR RAM boards only).
    fn write_chr(&mut self, address: u16, value: u8);

    /// Current name-table mirroring.
    fn mirroring(&self) -> Mirroring;
}

/// Shared handle to the mapper; the CPU bus, the PPU memory and the
/// repository tag all look through this.
pub type MapperHandle = Rc<RefCell<Box<dyn Mapper>>>;

/// Instantiates the mapper for a parsed image.
pub fn create_mapper(ines: &InesFile) -> Result<MapperHandle, String> {
    let mapper: Box<dyn Mapper> = match ines.mapper_id() {
        0 => Box::new(Nrom::new(ines)),
        1 => Box::new(Mmc1::new(ines)),
        id => return Err(format!("Unknown mapper id {id}")),
    };

    Ok(Rc::new(RefCell::new(mapper)))
}

/// NROM (mapper 0): no banking at all.
///
/// PRG is the first bank glued to the last one, which handles both the
/// 16 KiB (mirrored) and 32 KiB layouts in one stroke.
pub struct Nrom {
    prg: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    mirroring: Mirroring,
}

impl Nrom {
    pub fn new(ines: &InesFile) -> Self {
        let banks = ines.prg_banks();
        let mut prg = Vec::with_capacity(2 * PRG_BANK_SIZE);
        if let (Some(first), Some(last)) = (banks.first(), banks.last()) {
            prg.extend_from_slice(first);
            prg.extend_from_slice(last);
        }

        let (chr, chr_is_ram) = match ines.chr_banks().first() {
            Some(bank) => (bank.clone(), false),
            None => (vec![0; CHR_BANK_SIZE], true),
        };

        Self { prg, chr, chr_is_ram, mirroring: ines.mirroring() }
    }
}

impl Mapper for Nrom {
    fn name(&self) -> &'static str {
        "NROM"
    }

    fn tag(&self) -> u64 {
        // No bank switching, no PRG writes: one constant configuration.
        0
    }

    fn read(&mut self, address: u16) -> u8 {
        if address < 0x8000 {
            return 0;
        }

        self.prg
            .get((address - 0x8000) as usize)
            .copied()
            .unwrap_or(0)
    }

    fn write(&mut self, _address: u16, _value: u8) {
        // NROM ignores write access.
    }

    fn read_chr(&mut self, address: u16) -> u8 {
        self.chr.get(address as usize).copied().unwrap_or(0)
    }

    fn write_chr(&mut self, address: u16, value: u8) {
        if self.chr_is_ram {
            if let Some(byte) = self.chr.get_mut(address as usize) {
                *byte = value;
            }
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }
}

/// MMC1 (mapper 1): serial 5-bit register loading, switchable PRG/CHR banks
/// and software-controlled mirroring.
pub struct Mmc1 {
    prg_banks: Vec<Vec<u8>>,
    chr_banks: Vec<Vec<u8>>,
    chr_ram: Vec<u8>,
    chr_is_ram: bool,
    work_ram: Vec<u8>,

    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,

    shift_register: u8,
    write_count: u8,
}

// Control register bits.
const MMC1_ENABLE_MIRRORING: u8 = 0x02;
const MMC1_PRG_MODE: u8 = 0x0C;
const MMC1_CHR_MODE: u8 = 0x10;
const MMC1_RESET: u8 = 0x80;

// Bit 0 of the CHR bank 1 register selects the mirroring axis.
const MMC1_MIRROR_HORIZONTAL: u8 = 0x01;

impl Mmc1 {
    pub fn new(ines: &InesFile) -> Self {
        let chr_is_ram = ines.chr_banks().is_empty();

        Self {
            prg_banks: ines.prg_banks().to_vec(),
            chr_banks: ines.chr_banks().to_vec(),
            chr_ram: if chr_is_ram { vec![0; CHR_BANK_SIZE] } else { Vec::new() },
            chr_is_ram,
            work_ram: vec![0; 0x2000 * ines.ram_banks() as usize],
            // Power-on: 16 KiB PRG mode with the last bank fixed.
            control: MMC1_PRG_MODE,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
            shift_register: 0,
            write_count: 0,
        }
    }

    /// PRG bank offsets for `$8000` and `$C000`.
    fn prg_offsets(&self) -> (usize, usize) {
        let bank = (self.prg_bank & 0x0F) as usize;
        let count = self.prg_banks.len().max(1);
        let last = count - 1;

        match (self.control >> 2) & 0x03 {
            0 | 1 => {
                // 32 KiB mode: the low bit of the bank number is ignored.
                let low = bank & !1;
                ((low % count) * PRG_BANK_SIZE, ((low | 1) % count) * PRG_BANK_SIZE)
            }
            2 => (0, (bank % count) * PRG_BANK_SIZE),
            _ => ((bank % count) * PRG_BANK_SIZE, last * PRG_BANK_SIZE),
        }
    }

    /// CHR addressing in 4 KiB units: returns `(bank, offset)` pairs for the
    /// two pattern tables.
    fn chr_offsets(&self) -> (usize, usize) {
        let half = CHR_BANK_SIZE / 2;
        let total_halves = (self.chr_banks.len().max(1)) * 2;

        if self.control & MMC1_CHR_MODE != 0 {
            let low = (self.chr_bank0 as usize) % total_halves;
            let high = (self.chr_bank1 as usize) % total_halves;
            (low * half, high * half)
        } else {
            let low = ((self.chr_bank0 & !1) as usize) % total_halves;
            (low * half, (low + 1) * half)
        }
    }

    fn chr_byte(&self, offset: usize) -> u8 {
        if self.chr_is_ram {
            return self.chr_ram.get(offset % CHR_BANK_SIZE).copied().unwrap_or(0);
        }

        let bank = offset / CHR_BANK_SIZE;
        let inner = offset % CHR_BANK_SIZE;
        self.chr_banks
            .get(bank)
            .and_then(|b| b.get(inner))
            .copied()
            .unwrap_or(0)
    }

    fn write_register(&mut self, address: u16, value: u8) {
        if value & MMC1_RESET != 0 {
            self.shift_register = 0;
            self.write_count = 0;
            self.control |= MMC1_PRG_MODE;
            return;
        }

        // The shift register fills lowest bit first.
        self.shift_register |= (value & 1) << self.write_count;
        self.write_count += 1;

        if self.write_count == 5 {
            let data = self.shift_register & 0x1F;

            // Register select by address window, 8 KiB each.
            match (address >> 13) & 0x03 {
                0 => self.control = data,
                1 => self.chr_bank0 = data,
                2 => self.chr_bank1 = data,
                _ => self.prg_bank = data,
            }

            self.shift_register = 0;
            self.write_count = 0;
        }
    }
}

impl Mapper for Mmc1 {
    fn name(&self) -> &'static str {
        "MMC1"
    }

    fn tag(&self) -> u64 {
        // The PRG bank number plus the PRG banking mode bits are everything
        // that can change what the CPU reads from ROM.
        u64::from(self.prg_bank) | (u64::from(self.control & MMC1_PRG_MODE) << 5)
    }

    fn read(&mut self, address: u16) -> u8 {
        if address < 0x6000 {
            return 0;
        }

        if address < 0x8000 {
            let offset = (address - 0x6000) as usize;
            return self.work_ram.get(offset).copied().unwrap_or(0);
        }

        let (low, high) = self.prg_offsets();
        let (base, offset) = if address < 0xC000 {
            (low, (address - 0x8000) as usize)
        } else {
            (high, (address - 0xC000) as usize)
        };

        let bank = base / PRG_BANK_SIZE;
        self.prg_banks
            .get(bank)
            .and_then(|b| b.get(offset))
            .copied()
            .unwrap_or(0)
    }

    fn write(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            self.write_register(address, value);
        } else if address >= 0x6000 {
            let offset = (address - 0x6000) as usize;
            if let Some(byte) = self.work_ram.get_mut(offset) {
                *byte = value;
            }
        }
    }

    fn read_chr(&mut self, address: u16) -> u8 {
        let half = CHR_BANK_SIZE / 2;
        let (low, high) = self.chr_offsets();

        if (address as usize) < half {
            self.chr_byte(low + address as usize)
        } else {
            self.chr_byte(high + (address as usize - half))
        }
    }

    fn write_chr(&mut self, address: u16, value: u8) {
        if self.chr_is_ram {
            let offset = (address as usize) % CHR_BANK_SIZE;
            self.chr_ram[offset] = value;
        }
    }

    fn mirroring(&self) -> Mirroring {
        // Mirroring is gated by the control register but the axis comes out
        // of the CHR bank 1 register's low bit.
        if self.control & MMC1_ENABLE_MIRRORING != 0 {
            if self.chr_bank1 & MMC1_MIRROR_HORIZONTAL != 0 {
                Mirroring::Horizontal
            } else {
                Mirroring::Vertical
            }
        } else {
            Mirroring::Single
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn make_rom(mapper: u8, prg_banks: u8, chr_banks: u8) -> Vec<u8> {
        let mut rom =
            vec![0u8; 16 + prg_banks as usize * PRG_BANK_SIZE + chr_banks as usize * CHR_BANK_SIZE];
        rom[0..4].copy_from_slice(b"NES\x1A");
        rom[4] = prg_banks;
        rom[5] = chr_banks;
        rom[6] = mapper << 4;
        rom[7] = mapper & 0xF0;
        rom
    }

    #[test]
    fn rejects_bad_images() {
        assert_eq!(InesFile::load(&[0; 4]).unwrap_err(), "File too small");

        let mut bad_magic = make_rom(0, 1, 1);
        bad_magic[0] = b'X';
        assert_eq!(InesFile::load(&bad_magic).unwrap_err(), "Invalid magic");

        let truncated = &make_rom(0, 2, 1)[..20000];
        assert_eq!(InesFile::load(truncated).unwrap_err(), "File too small");

        let mut unknown = make_rom(9, 1, 1);
        unknown[6] = 9 << 4;
        let ines = InesFile::load(&unknown).unwrap();
        assert!(create_mapper(&ines).is_err());
    }

    #[test]
    fn header_fields_decode() {
        let mut rom = make_rom(1, 2, 1);
        rom[6] |= 0x01 | 0x02; // Vertical mirroring, battery RAM.
        rom[9] = 0x01; // PAL.

        let ines = InesFile::load(&rom).unwrap();
        assert_eq!(ines.mapper_id(), 1);
        assert_eq!(ines.prg_banks().len(), 2);
        assert_eq!(ines.chr_banks().len(), 1);
        assert_eq!(ines.mirroring(), Mirroring::Vertical);
        assert!(ines.has_battery_ram());
        assert!(ines.is_pal());
        assert_eq!(ines.ram_banks(), 1); // Zero is treated as one.
    }

    #[test]
    fn trainer_is_skipped() {
        let mut rom = make_rom(0, 1, 1);
        rom[6] |= 0x04;
        // Insert the 512-byte trainer between header and banks.
        let mut with_trainer = rom[..16].to_vec();
        with_trainer.extend_from_slice(&[0xEE; TRAINER_SIZE]);
        with_trainer.extend_from_slice(&rom[16..]);
        // Mark the first PRG byte so we can spot it.
        let prg_start = 16 + TRAINER_SIZE;
        with_trainer[prg_start] = 0x42;

        let ines = InesFile::load(&with_trainer).unwrap();
        assert_eq!(ines.prg_banks()[0][0], 0x42);
    }

    #[test]
    fn nrom_mirrors_a_single_bank() {
        let mut rom = make_rom(0, 1, 1);
        rom[16] = 0x42; // First PRG byte.

        let ines = InesFile::load(&rom).unwrap();
        let mapper = create_mapper(&ines).unwrap();
        let mut mapper = mapper.borrow_mut();

        assert_eq!(mapper.read(0x8000), 0x42);
        assert_eq!(mapper.read(0xC000), 0x42); // Mirrored.
        assert_eq!(mapper.tag(), 0);

        mapper.write(0x8000, 0xFF); // Ignored.
        assert_eq!(mapper.read(0x8000), 0x42);
    }

    #[test]
    fn mmc1_serial_register_write() {
        let rom = make_rom(1, 4, 1);
        let ines = InesFile::load(&rom).unwrap();
        let mut mapper = Mmc1::new(&ines);

        // Load 0b01110 into the control register bit by bit.
        for bit in [0, 1, 1, 1, 0] {
            mapper.write(0x8000, bit);
        }
        assert_eq!(mapper.control, 0b01110);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
    }

    #[test]
    fn mmc1_mirroring_follows_the_chr_bank1_register() {
        let rom = make_rom(1, 2, 2);
        let ines = InesFile::load(&rom).unwrap();
        let mut mapper = Mmc1::new(&ines);

        // Enable mirroring through the control register (bit 1); the axis
        // defaults to vertical while CHR bank 1's low bit is clear.
        for bit in [0, 1, 0, 0, 0] {
            mapper.write(0x8000, bit);
        }
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);

        // Flip the axis purely through the CHR bank 1 register, leaving the
        // control register untouched.
        for bit in [1, 0, 0, 0, 0] {
            mapper.write(0xC000, bit);
        }
        assert_eq!(mapper.mirroring(), Mirroring::Horizontal);

        // Clearing the enable bit falls back to single-screen no matter
        // what the CHR bank register holds.
        for bit in [0, 0, 0, 0, 0] {
            mapper.write(0x8000, bit);
        }
        assert_eq!(mapper.mirroring(), Mirroring::Single);
    }

    #[test]
    fn mmc1_tag_follows_prg_banking() {
        let rom = make_rom(1, 4, 1);
        let ines = InesFile::load(&rom).unwrap();
        let mut mapper = Mmc1::new(&ines);

        let before = mapper.tag();
        // Select PRG bank 2 (register 3).
        for bit in [0, 1, 0, 0, 0] {
            mapper.write(0xE000, bit);
        }
        assert_ne!(mapper.tag(), before);
    }

    #[test]
    fn mmc1_work_ram_round_trip() {
        let rom = make_rom(1, 2, 1);
        let ines = InesFile::load(&rom).unwrap();
        let mut mapper = Mmc1::new(&ines);

        mapper.write(0x6000, 0x55);
        assert_eq!(mapper.read(0x6000), 0x55);
    }

    #[test]
    fn mmc1_reset_restores_prg_mode() {
        let rom = make_rom(1, 2, 1);
        let ines = InesFile::load(&rom).unwrap();
        let mut mapper = Mmc1::new(&ines);

        mapper.write(0x8000, 0); // Begin a serial write...
        mapper.write(0x8000, MMC1_RESET); // ...then abort it.
        assert_eq!(mapper.write_count, 0);
        assert_eq!(mapper.control & MMC1_PRG_MODE, MMC1_PRG_MODE);
    }
}
