//! Parsed GPS receiver sentences
//!
//! Each parser takes the comma-split words of a sentence (type first, NMEA
//! framing already stripped) and checks the exact field count the
//! receiver firmware emits.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpsParseError {
    #[error("${sentence} should have {expected} fields after the type but has {got}")]
    FieldCount {
        sentence: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("${sentence} should have at least {min} fields after the type but has {got}")]
    TooFewFields {
        sentence: &'static str,
        min: usize,
        got: usize,
    },

    #[error("${sentence} field {field} is not a number: [{value}]")]
    BadNumber {
        sentence: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("$GPRMC carries an impossible date/time: date [{date}] time [{time}]")]
    BadTimestamp { date: String, time: String },
}

fn expect_fields(
    words: &[String],
    sentence: &'static str,
    expected: usize,
) -> Result<(), GpsParseError> {
    let got = words.len().saturating_sub(1);
    if got != expected {
        return Err(GpsParseError::FieldCount {
            sentence,
            expected,
            got,
        });
    }
    Ok(())
}

fn number<T: FromStr>(
    sentence: &'static str,
    field: &'static str,
    value: &str,
) -> Result<T, GpsParseError> {
    value.trim().parse().map_err(|_| GpsParseError::BadNumber {
        sentence,
        field,
        value: value.to_string(),
    })
}

/// Recommended minimum data (`$GPRMC`)
#[derive(Debug, Clone, PartialEq)]
pub struct GprmcRecord {
    /// `HHMMSS.sss`
    pub utc_time: String,
    /// `A` valid, `V` invalid
    pub status: String,
    pub lat: String,
    pub lat_ref: String,
    pub lon: String,
    pub lon_ref: String,
    pub speed_knots: String,
    pub heading: String,
    /// `DDMMYY`
    pub date: String,
    pub mag_var: String,
    pub mag_ref: String,
}

impl GprmcRecord {
    pub fn parse(words: &[String]) -> Result<Self, GpsParseError> {
        expect_fields(words, "GPRMC", 11)?;
        Ok(Self {
            utc_time: words[1].clone(),
            status: words[2].clone(),
            lat: words[3].clone(),
            lat_ref: words[4].clone(),
            lon: words[5].clone(),
            lon_ref: words[6].clone(),
            speed_knots: words[7].clone(),
            heading: words[8].clone(),
            date: words[9].clone(),
            mag_var: words[10].clone(),
            mag_ref: words[11].clone(),
        })
    }

    /// Fix time rounded to the nearest whole second
    ///
    /// Rounding up to 60 seconds carries into minute, hour, day, month and
    /// year, leap years included.
    pub fn datetime(&self) -> Result<NaiveDateTime, GpsParseError> {
        let bad = || GpsParseError::BadTimestamp {
            date: self.date.clone(),
            time: self.utc_time.clone(),
        };
        let digits = |s: &str, range: std::ops::Range<usize>| -> Result<u32, GpsParseError> {
            s.get(range).and_then(|d| d.parse().ok()).ok_or_else(bad)
        };
        let day = digits(&self.date, 0..2)?;
        let month = digits(&self.date, 2..4)?;
        let year = 2000 + self.date.get(4..).and_then(|d| d.parse::<i32>().ok()).ok_or_else(bad)?;
        let hour = digits(&self.utc_time, 0..2)?;
        let minute = digits(&self.utc_time, 2..4)?;
        let seconds: f64 = self
            .utc_time
            .get(4..)
            .and_then(|s| s.parse().ok())
            .ok_or_else(bad)?;
        if !(0.0..61.0).contains(&seconds) {
            return Err(bad());
        }

        let start_of_minute = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .ok_or_else(bad)?;
        Ok(start_of_minute + ChronoDuration::seconds(seconds.round() as i64))
    }
}

/// Fix data (`$GPGGA`)
#[derive(Debug, Clone, PartialEq)]
pub struct GpggaRecord {
    pub utc_time: String,
    pub lat: String,
    pub lat_ref: String,
    pub lon: String,
    pub lon_ref: String,
    /// 0 no fix, 1 GPS fix, 2 differential
    pub quality: String,
    pub satellites: u32,
    pub hdop: String,
    pub altitude_msl: String,
    pub geoid_separation: String,
}

impl GpggaRecord {
    pub fn parse(words: &[String]) -> Result<Self, GpsParseError> {
        expect_fields(words, "GPGGA", 14)?;
        Ok(Self {
            utc_time: words[1].clone(),
            lat: words[2].clone(),
            lat_ref: words[3].clone(),
            lon: words[4].clone(),
            lon_ref: words[5].clone(),
            quality: words[6].clone(),
            satellites: number("GPGGA", "satellites", &words[7])?,
            hdop: words[8].clone(),
            altitude_msl: words[9].clone(),
            geoid_separation: words[11].clone(),
        })
    }
}

/// Command codes of the receiver's proprietary `$PDME` command set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PdmeCode {
    ColdStart = 0,
    WarmStart = 1,
    HotStart = 2,
    VersionInfo = 4,
    GetDilution = 5,
    SetDilution = 6,
    GetMaskAngle = 7,
    SetMaskAngle = 8,
    InitPosTime = 9,
    NmeaPortControl = 10,
    NmeaMessageConfig = 11,
    SysCtrlSetA = 12,
    SysCtrlSetB = 13,
    GpioRead = 14,
    GpioWrite = 15,
    SwConfigSet = 16,
    SwConfigGet = 17,
    SwConfigSave = 18,
    SwConfigReset = 19,
    SwConfigSelect = 20,
    PositionHold = 21,
    Traim = 22,
    BinaryMode = 23,
}

impl PdmeCode {
    pub fn from_code(code: u32) -> Option<Self> {
        use PdmeCode::*;
        Some(match code {
            0 => ColdStart,
            1 => WarmStart,
            2 => HotStart,
            4 => VersionInfo,
            5 => GetDilution,
            6 => SetDilution,
            7 => GetMaskAngle,
            8 => SetMaskAngle,
            9 => InitPosTime,
            10 => NmeaPortControl,
            11 => NmeaMessageConfig,
            12 => SysCtrlSetA,
            13 => SysCtrlSetB,
            14 => GpioRead,
            15 => GpioWrite,
            16 => SwConfigSet,
            17 => SwConfigGet,
            18 => SwConfigSave,
            19 => SwConfigReset,
            20 => SwConfigSelect,
            21 => PositionHold,
            22 => Traim,
            23 => BinaryMode,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Restarts are confirmed by the reset banner rather than a `$PDME` reply
    pub fn is_restart(self) -> bool {
        matches!(
            self,
            PdmeCode::ColdStart | PdmeCode::WarmStart | PdmeCode::HotStart
        )
    }
}

/// Acknowledgement of a `$PDME` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdmeReply {
    pub code: u32,
    pub ok: bool,
}

/// Outcome of parsing a `$PDME` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdmeParse {
    Reply(PdmeReply),
    /// Informational multi-field reply that is not an acknowledgement
    Extended,
}

impl PdmeReply {
    pub fn parse(words: &[String]) -> Result<PdmeParse, GpsParseError> {
        let got = words.len().saturating_sub(1);
        if got < 2 {
            return Err(GpsParseError::TooFewFields {
                sentence: "PDME",
                min: 2,
                got,
            });
        }
        let code: u32 = number("PDME", "command code", &words[1])?;
        if code == PdmeCode::PositionHold.code() && got > 2 && words[2] != "OK" {
            return Ok(PdmeParse::Extended);
        }
        if got > 2 && code != PdmeCode::Traim.code() {
            return Err(GpsParseError::FieldCount {
                sentence: "PDME",
                expected: 2,
                got,
            });
        }
        // Multi-field TRAIM replies carry no status word; count them as acknowledged.
        let ok = got > 2 || words[2] == "OK";
        Ok(PdmeParse::Reply(PdmeReply { code, ok }))
    }
}

/// Largest TRAIM-reported time error still considered good
pub const MAX_TRAIM_ERROR_SECS: f64 = 100e-9;

/// TRAIM solution status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraimStatus {
    /// All satellites agree within the alarm threshold
    UnderAlarm,
    /// Some satellites were dropped for exceeding the threshold
    OverAlarm,
    Unknown,
}

impl TraimStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TraimStatus::UnderAlarm),
            1 => Some(TraimStatus::OverAlarm),
            2 => Some(TraimStatus::Unknown),
            _ => None,
        }
    }
}

/// Timing receiver integrity report (`$PDMETRAIM`)
#[derive(Debug, Clone, PartialEq)]
pub struct TraimRecord {
    pub solution_code: i64,
    pub solution: TraimStatus,
    pub valid_code: i64,
    /// Estimated time error in seconds
    pub time_error: f64,
    pub removed_satellites: u32,
    pub bad_satellite_ids: Vec<String>,
}

impl TraimRecord {
    pub fn parse(words: &[String]) -> Result<Self, GpsParseError> {
        expect_fields(words, "PDMETRAIM", 16)?;
        let solution_code: i64 = number("PDMETRAIM", "solution", &words[1])?;
        let time_error: f64 = number("PDMETRAIM", "time error", &words[3])?;
        if !time_error.is_finite() {
            return Err(GpsParseError::BadNumber {
                sentence: "PDMETRAIM",
                field: "time error",
                value: words[3].clone(),
            });
        }
        Ok(Self {
            solution_code,
            solution: TraimStatus::from_code(solution_code).unwrap_or(TraimStatus::Unknown),
            valid_code: number("PDMETRAIM", "valid", &words[2])?,
            time_error,
            removed_satellites: number("PDMETRAIM", "removed SVIDs", &words[4])?,
            bad_satellite_ids: words[5..].to_vec(),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid_code == 1
    }

    /// Reported time error lies in (0, 100 ns]
    pub fn uncertainty_in_range(&self) -> bool {
        self.time_error > 0.0 && self.time_error <= MAX_TRAIM_ERROR_SECS
    }

    /// Every satellite in use was removed, or the count in use is unknown
    pub fn all_satellites_bad(&self, satellites: Option<u32>) -> bool {
        self.removed_satellites > 0
            && satellites.map_or(true, |n| self.removed_satellites >= n)
    }

    /// Whether this report alone vouches for the receiver's timing
    pub fn vouches_for_time(&self, satellites: Option<u32>) -> bool {
        self.is_valid() && !self.all_satellites_bad(satellites) && self.uncertainty_in_range()
    }
}

/// Position-hold status (`$PDMEPOSHOLD`)
#[derive(Debug, Clone, PartialEq)]
pub struct PosholdRecord {
    pub on: bool,
    pub lat: String,
    pub lat_ref: String,
    pub lon: String,
    pub lon_ref: String,
    pub height: String,
}

impl PosholdRecord {
    pub fn parse(words: &[String]) -> Result<Self, GpsParseError> {
        expect_fields(words, "PDMEPOSHOLD", 6)?;
        let on_off: i64 = number("PDMEPOSHOLD", "on/off", &words[1])?;
        Ok(Self {
            on: on_off == 1,
            lat: words[2].clone(),
            lat_ref: words[3].clone(),
            lon: words[4].clone(),
            lon_ref: words[5].clone(),
            height: words[6].clone(),
        })
    }
}

/// Reset banner line (`$PDMEHEADER1` hardware, `$PDMEHEADER2` firmware)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub num: u8,
    pub version: String,
}

impl HeaderRecord {
    pub fn parse(words: &[String], num: u8) -> Result<Self, GpsParseError> {
        let sentence = if num == 1 { "PDMEHEADER1" } else { "PDMEHEADER2" };
        expect_fields(words, sentence, 1)?;
        Ok(Self {
            num,
            version: words[1].clone(),
        })
    }
}

/// Free text line, the last line of the reset banner (`$GPTXT`)
pub fn parse_gptxt(words: &[String]) -> Result<String, GpsParseError> {
    expect_fields(words, "GPTXT", 1)?;
    Ok(words[1].clone())
}
