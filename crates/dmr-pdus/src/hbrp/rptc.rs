use dmr_core::PduParseErr;

/// Length of the RPTC body after the token and repeater id
pub const RPTC_BODY_LEN: usize = 294;

/// The repeater configuration carried in an RPTC frame.
///
/// All fields are fixed-width ASCII; numeric fields are ASCII-decimal and
/// a single bad numeric field fails the whole frame.
///
/// ```text
/// offset  size  field
/// 0       8     callsign
/// 8       9     rx frequency (Hz)
/// 17      9     tx frequency (Hz)
/// 26      2     tx power (dBm, 0-99)
/// 28      2     color code (1-15)
/// 30      8     latitude  (signed decimal degrees)
/// 38      9     longitude (signed decimal degrees)
/// 47      3     antenna height (m)
/// 50      20    location
/// 70      19    description
/// 89      1     slots
/// 90      124   URL
/// 214     40    software id
/// 254     40    package id
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RptcFrame {
    pub callsign: String,
    pub rx_freq: u32,
    pub tx_freq: u32,
    pub tx_power: u8,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: u16,
    pub location: String,
    pub description: String,
    pub slots: u8,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

impl RptcFrame {
    pub fn parse(body: &[u8]) -> Result<Self, PduParseErr> {
        if body.len() != RPTC_BODY_LEN {
            return Err(PduParseErr::InconsistentLength {
                expected: RPTC_BODY_LEN,
                found: body.len(),
            });
        }

        let color_code = parse_decimal(&body[28..30], "color_code")? as u8;
        if !(1..=15).contains(&color_code) {
            return Err(PduParseErr::InvalidValue {
                field: "color_code",
                value: color_code as u64,
            });
        }

        Ok(RptcFrame {
            callsign: parse_text(&body[0..8]),
            rx_freq: parse_decimal(&body[8..17], "rx_freq")? as u32,
            tx_freq: parse_decimal(&body[17..26], "tx_freq")? as u32,
            tx_power: parse_decimal(&body[26..28], "tx_power")? as u8,
            color_code,
            latitude: parse_float(&body[30..38], "latitude")?,
            longitude: parse_float(&body[38..47], "longitude")?,
            height: parse_decimal(&body[47..50], "height")? as u16,
            location: parse_text(&body[50..70]),
            description: parse_text(&body[70..89]),
            slots: parse_decimal(&body[89..90], "slots")? as u8,
            url: parse_text(&body[90..214]),
            software_id: parse_text(&body[214..254]),
            package_id: parse_text(&body[254..294]),
        })
    }

    /// Serialize back to the 294-byte wire body (handy for tests and for
    /// probing hotspots in monitor tools).
    pub fn encode(&self) -> [u8; RPTC_BODY_LEN] {
        let mut body = [b' '; RPTC_BODY_LEN];
        put_text(&mut body[0..8], &self.callsign);
        put_text(&mut body[8..17], &format!("{:09}", self.rx_freq));
        put_text(&mut body[17..26], &format!("{:09}", self.tx_freq));
        put_text(&mut body[26..28], &format!("{:02}", self.tx_power));
        put_text(&mut body[28..30], &format!("{:02}", self.color_code));
        put_text(&mut body[30..38], &format!("{:+08.4}", self.latitude));
        put_text(&mut body[38..47], &format!("{:+09.4}", self.longitude));
        put_text(&mut body[47..50], &format!("{:03}", self.height));
        put_text(&mut body[50..70], &self.location);
        put_text(&mut body[70..89], &self.description);
        put_text(&mut body[89..90], &format!("{}", self.slots));
        put_text(&mut body[90..214], &self.url);
        put_text(&mut body[214..254], &self.software_id);
        put_text(&mut body[254..294], &self.package_id);
        body
    }
}

/// Trim a fixed-width ASCII field. Hotspots pad with spaces or NULs.
fn parse_text(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

fn parse_decimal(field: &[u8], name: &'static str) -> Result<u64, PduParseErr> {
    let text = parse_text(field);
    text.parse::<u64>().map_err(|_| PduParseErr::BadDecimalField { field: name })
}

fn parse_float(field: &[u8], name: &'static str) -> Result<f32, PduParseErr> {
    let text = parse_text(field);
    text.parse::<f32>().map_err(|_| PduParseErr::BadDecimalField { field: name })
}

fn put_text(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = usize::min(bytes.len(), dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RptcFrame {
        RptcFrame {
            callsign: "PD0TST".to_string(),
            rx_freq: 438_800_000,
            tx_freq: 431_200_000,
            tx_power: 10,
            color_code: 1,
            latitude: 52.3702,
            longitude: 4.8952,
            height: 15,
            location: "Amsterdam".to_string(),
            description: "Test hotspot".to_string(),
            slots: 2,
            url: "https://example.net".to_string(),
            software_id: "MMDVM_MMDVM_HS_Hat".to_string(),
            package_id: "MMDVM_2021".to_string(),
        }
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let frame = sample();
        let body = frame.encode();
        assert_eq!(body.len(), RPTC_BODY_LEN);
        let back = RptcFrame::parse(&body).unwrap();
        assert_eq!(back.callsign, frame.callsign);
        assert_eq!(back.rx_freq, frame.rx_freq);
        assert_eq!(back.tx_freq, frame.tx_freq);
        assert_eq!(back.color_code, frame.color_code);
        assert_eq!(back.slots, frame.slots);
        assert_eq!(back.location, frame.location);
    }

    #[test]
    fn test_bad_frequency_fails_whole_frame() {
        let mut body = sample().encode();
        body[8..17].copy_from_slice(b"43x800000");
        assert_eq!(
            RptcFrame::parse(&body).unwrap_err(),
            PduParseErr::BadDecimalField { field: "rx_freq" }
        );
    }

    #[test]
    fn test_color_code_range_checked() {
        let mut body = sample().encode();
        body[28..30].copy_from_slice(b"16");
        assert_eq!(
            RptcFrame::parse(&body).unwrap_err(),
            PduParseErr::InvalidValue { field: "color_code", value: 16 }
        );
        body[28..30].copy_from_slice(b"00");
        assert!(RptcFrame::parse(&body).is_err());
    }

    #[test]
    fn test_nul_padded_fields() {
        let mut body = sample().encode();
        // NUL-pad the callsign as some hotspot firmware does
        body[0..8].copy_from_slice(b"PD0TST\0\0");
        let frame = RptcFrame::parse(&body).unwrap();
        assert_eq!(frame.callsign, "PD0TST");
    }

    #[test]
    fn test_wrong_body_length() {
        assert!(RptcFrame::parse(&[b' '; 100]).is_err());
    }
}
