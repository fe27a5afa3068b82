//! KCD (Kayak CAN Description) bus-file reader/writer (§6.3, feature `kcd`).
//!
//! Reads and writes the subset of the format this crate's [`Configuration`]
//! can represent: `NetworkDefinition > Bus[name] > Message[id,name,length,
//! interval,format] > {Producer>NodeRef[id]; Signal[offset,length,name,
//! endianess]>{Value[slope,intercept,unit,min,max,type]; Notes}}`. Note the
//! spelling `endianess` on the wire, which this module preserves verbatim.

use std::path::Path;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::bits::Endianness;
use crate::config::Configuration;
use crate::definition::{CanFrameDefinition, FrameFormat, MAX_NUMBER_OF_CAN_DATA_BYTES};
use crate::errors::{Error, Result};
use crate::signal::{CanSignalDefinition, SignalType};

const FLOAT_COMPARISON_EPSILON: f64 = 1e-9;
const DEFAULT_BUS_NAME: &str = "Mainbus";

/// Reads a KCD document from a file. See [`from_kcd_str`].
pub fn from_kcd_file(path: impl AsRef<Path>, bus_name: Option<&str>) -> Result<Configuration> {
    let path = path.as_ref();
    log::info!("parsing KCD file: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    from_kcd_str(&text, bus_name)
}

/// Parses a KCD document. With no `bus_name`, selects whichever `Bus`
/// element sorts first alphabetically by name.
pub fn from_kcd_str(xml: &str, bus_name: Option<&str>) -> Result<Configuration> {
    let mut available = collect_bus_names(xml)?;
    if available.is_empty() {
        return Err(Error::Kcd("no <Bus> definition found in document".into()));
    }
    log::debug!("found buses: {}", available.join(", "));

    let chosen = match bus_name {
        Some(name) => {
            if !available.iter().any(|n| n == name) {
                return Err(Error::Kcd(format!(
                    "no bus named '{name}' in document; available: {}",
                    available.join(", ")
                )));
            }
            name.to_string()
        }
        None => {
            available.sort();
            available.remove(0)
        }
    };
    log::debug!("using bus '{chosen}'");

    parse_bus(xml, &chosen)
}

/// Writes `config` as a KCD document to a file.
pub fn write_kcd_file(config: &Configuration, path: impl AsRef<Path>) -> Result<()> {
    let text = to_kcd_string(config)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Renders `config` as a KCD document.
pub fn to_kcd_string(config: &Configuration) -> Result<String> {
    let bus_name = config.bus_name().unwrap_or(DEFAULT_BUS_NAME).to_string();

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .create_element("NetworkDefinition")
        .with_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"))
        .with_attribute(("xmlns", "http://kayak.2codeornot2code.org/1.0"))
        .with_attribute(("xsi:noNamespaceSchemaLocation", "Definition.xsd"))
        .write_inner_content::<_, Error>(|writer| {
            writer.create_element("Document").write_empty()?;
            writer
                .create_element("Bus")
                .with_attribute(("name", bus_name.as_str()))
                .write_inner_content::<_, Error>(|writer| {
                    let mut ids: Vec<_> = config.frame_definitions().keys().copied().collect();
                    ids.sort_unstable();
                    for id in ids {
                        write_message(writer, &config.frame_definitions()[&id])?;
                    }
                    Ok(())
                })?;
            Ok(())
        })?;

    let bytes = writer.into_inner();
    String::from_utf8(bytes).map_err(|e| Error::Kcd(format!("generated non-UTF-8 XML: {e}")))
}

fn write_message(writer: &mut Writer<Vec<u8>>, def: &CanFrameDefinition) -> Result<()> {
    let id_str = format!("0x{:03X}", def.frame_id());
    let length_str = def.dlc().to_string();
    let interval_str = def.cycle_time().map(|v| v.to_string());
    let is_extended = def.frame_format() == FrameFormat::Extended;

    let mut elem = writer
        .create_element("Message")
        .with_attribute(("id", id_str.as_str()))
        .with_attribute(("name", def.name()))
        .with_attribute(("length", length_str.as_str()));
    if let Some(interval) = &interval_str {
        elem = elem.with_attribute(("interval", interval.as_str()));
    }
    if is_extended {
        elem = elem.with_attribute(("format", "extended"));
    }

    elem.write_inner_content::<_, Error>(|writer| {
        for signal in def.signals() {
            write_signal(writer, signal)?;
        }
        if !def.producer_ids().is_empty() {
            writer
                .create_element("Producer")
                .write_inner_content::<_, Error>(|writer| {
                    for id in def.producer_ids() {
                        writer
                            .create_element("NodeRef")
                            .with_attribute(("id", id.as_str()))
                            .write_empty()?;
                    }
                    Ok(())
                })?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_signal(writer: &mut Writer<Vec<u8>>, signal: &CanSignalDefinition) -> Result<()> {
    let offset_str = signal.start_bit().to_string();
    let length_str = signal.num_bits().to_string();

    let mut elem = writer
        .create_element("Signal")
        .with_attribute(("name", signal.name()))
        .with_attribute(("offset", offset_str.as_str()));
    if signal.num_bits() > 1 {
        elem = elem.with_attribute(("length", length_str.as_str()));
    }
    if signal.endianness() == Endianness::Big {
        elem = elem.with_attribute(("endianess", "big"));
    }

    let value_attrs = value_attributes(signal);
    let has_notes = signal.comment().is_some_and(|c| !c.is_empty());

    if value_attrs.is_empty() && !has_notes {
        elem.write_empty()?;
        return Ok(());
    }

    elem.write_inner_content::<_, Error>(|writer| {
        if let Some(comment) = signal.comment().filter(|c| !c.is_empty()) {
            writer
                .create_element("Notes")
                .write_text_content(BytesText::new(comment))?;
        }
        if !value_attrs.is_empty() {
            let mut value_elem = writer.create_element("Value");
            for (k, v) in &value_attrs {
                value_elem = value_elem.with_attribute((k.as_str(), v.as_str()));
            }
            value_elem.write_empty()?;
        }
        Ok(())
    })?;
    Ok(())
}

fn value_attributes(signal: &CanSignalDefinition) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    if (signal.scale() - 1.0).abs() > FLOAT_COMPARISON_EPSILON {
        attrs.push(("slope".to_string(), format_float(signal.scale())));
    }
    if signal.offset().abs() > FLOAT_COMPARISON_EPSILON {
        attrs.push(("intercept".to_string(), format_float(signal.offset())));
    }
    if signal.signal_type() != SignalType::Unsigned {
        attrs.push(("type".to_string(), signal_type_str(signal.signal_type()).to_string()));
    }
    if let Some(unit) = signal.unit() {
        if !unit.is_empty() {
            attrs.push(("unit".to_string(), unit.to_string()));
        }
    }
    if let Some(min) = signal.min() {
        attrs.push(("min".to_string(), format_float(min)));
    }
    if let Some(max) = signal.max() {
        attrs.push(("max".to_string(), format_float(max)));
    }
    attrs
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.0}")
    } else {
        v.to_string()
    }
}

fn signal_type_str(t: SignalType) -> &'static str {
    match t {
        SignalType::Unsigned => "unsigned",
        SignalType::Signed => "signed",
        SignalType::Single => "single",
        SignalType::Double => "double",
    }
}

fn local_name(e: &BytesStart) -> Vec<u8> {
    e.name().local_name().as_ref().to_vec()
}

fn attr_value(e: &BytesStart, key: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Kcd(format!("malformed attribute: {err}")))?;
        if attr.key.local_name().as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| Error::Kcd(format!("malformed attribute value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn collect_bus_names(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut names = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if local_name(&e) == b"Bus" => {
                let name = attr_value(&e, "name")?
                    .ok_or_else(|| Error::Kcd("<Bus> element missing 'name' attribute".into()))?;
                names.push(name);
            }
            _ => {}
        }
    }
    Ok(names)
}

struct MessageBuilder {
    frame_id: u32,
    name: String,
    dlc: u8,
    cycle_time: Option<u32>,
    format: FrameFormat,
    producer_ids: Vec<String>,
    signals: Vec<CanSignalDefinition>,
}

struct SignalBuilder {
    name: String,
    start_bit: u32,
    num_bits: u32,
    endianness: Endianness,
    scale: f64,
    offset: f64,
    unit: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    signal_type: SignalType,
    comment: Option<String>,
}

fn parse_bus(xml: &str, bus_name: &str) -> Result<Configuration> {
    let mut reader = Reader::from_str(xml);

    let mut config = Configuration::new();
    config.set_bus_name(bus_name);

    let mut inside_bus = false;
    let mut message: Option<MessageBuilder> = None;
    let mut signal: Option<SignalBuilder> = None;
    let mut in_producer = false;
    let mut in_notes = false;
    let mut notes_text = String::new();

    loop {
        let event = reader.read_event()?;
        let is_empty = matches!(event, Event::Empty(_));
        match event {
            Event::Eof => break,

            Event::Start(e) | Event::Empty(e) if local_name(&e) == b"Bus" => {
                let name = attr_value(&e, "name")?.unwrap_or_default();
                if name == bus_name {
                    inside_bus = true;
                }
                if is_empty && inside_bus {
                    break;
                }
            }

            Event::End(e) if local_name(&e) == b"Bus" && inside_bus => {
                break;
            }

            Event::Start(e) | Event::Empty(e) if inside_bus && local_name(&e) == b"Message" => {
                let frame_id_str = attr_value(&e, "id")?
                    .ok_or_else(|| Error::Kcd("<Message> missing 'id'".into()))?;
                let frame_id = parse_hex_id(&frame_id_str)?;
                let name = attr_value(&e, "name")?
                    .ok_or_else(|| Error::Kcd("<Message> missing 'name'".into()))?;
                let dlc = match attr_value(&e, "length")? {
                    Some(s) => s
                        .parse()
                        .map_err(|_| Error::Kcd(format!("bad <Message length='{s}'>")))?,
                    None => MAX_NUMBER_OF_CAN_DATA_BYTES,
                };
                let cycle_time = match attr_value(&e, "interval")? {
                    Some(s) => Some(
                        s.parse::<f64>()
                            .map_err(|_| Error::Kcd(format!("bad <Message interval='{s}'>")))?
                            .round() as u32,
                    ),
                    None => None,
                };
                let format = match attr_value(&e, "format")?.as_deref() {
                    Some("extended") => FrameFormat::Extended,
                    _ => FrameFormat::Standard,
                };

                let builder = MessageBuilder {
                    frame_id,
                    name,
                    dlc,
                    cycle_time,
                    format,
                    producer_ids: Vec::new(),
                    signals: Vec::new(),
                };
                if is_empty {
                    finalize_message(&mut config, builder)?;
                } else {
                    message = Some(builder);
                }
            }

            Event::End(e) if inside_bus && local_name(&e) == b"Message" => {
                if let Some(builder) = message.take() {
                    finalize_message(&mut config, builder)?;
                }
            }

            Event::Start(e) if inside_bus && local_name(&e) == b"Producer" => {
                in_producer = true;
            }
            Event::End(e) if inside_bus && local_name(&e) == b"Producer" => {
                in_producer = false;
            }

            Event::Start(e) | Event::Empty(e) if inside_bus && local_name(&e) == b"NodeRef" => {
                if in_producer {
                    let id = attr_value(&e, "id")?
                        .ok_or_else(|| Error::Kcd("<NodeRef> missing 'id'".into()))?;
                    if let Some(msg) = message.as_mut() {
                        msg.producer_ids.push(id);
                    }
                }
            }

            Event::Start(e) | Event::Empty(e) if inside_bus && local_name(&e) == b"Signal" => {
                let name = attr_value(&e, "name")?
                    .ok_or_else(|| Error::Kcd("<Signal> missing 'name'".into()))?;
                let start_bit = attr_value(&e, "offset")?
                    .ok_or_else(|| Error::Kcd("<Signal> missing 'offset'".into()))?
                    .parse()
                    .map_err(|_| Error::Kcd("bad <Signal offset=...>".into()))?;
                let num_bits = match attr_value(&e, "length")? {
                    Some(s) => s
                        .parse()
                        .map_err(|_| Error::Kcd(format!("bad <Signal length='{s}'>")))?,
                    None => 1,
                };
                let endianness = match attr_value(&e, "endianess")?.as_deref() {
                    Some("big") => Endianness::Big,
                    _ => Endianness::Little,
                };

                let builder = SignalBuilder {
                    name,
                    start_bit,
                    num_bits,
                    endianness,
                    scale: 1.0,
                    offset: 0.0,
                    unit: None,
                    min: None,
                    max: None,
                    signal_type: SignalType::Unsigned,
                    comment: None,
                };
                if is_empty {
                    finalize_signal(message.as_mut(), builder)?;
                } else {
                    signal = Some(builder);
                }
            }

            Event::End(e) if inside_bus && local_name(&e) == b"Signal" => {
                if let Some(builder) = signal.take() {
                    finalize_signal(message.as_mut(), builder)?;
                }
            }

            Event::Start(e) | Event::Empty(e) if inside_bus && local_name(&e) == b"Value" => {
                if let Some(sig) = signal.as_mut() {
                    if let Some(s) = attr_value(&e, "slope")? {
                        sig.scale = s
                            .parse()
                            .map_err(|_| Error::Kcd(format!("bad <Value slope='{s}'>")))?;
                    }
                    if let Some(s) = attr_value(&e, "intercept")? {
                        sig.offset = s
                            .parse()
                            .map_err(|_| Error::Kcd(format!("bad <Value intercept='{s}'>")))?;
                    }
                    if let Some(s) = attr_value(&e, "unit")? {
                        sig.unit = Some(s);
                    }
                    if let Some(s) = attr_value(&e, "min")? {
                        sig.min = Some(
                            s.parse()
                                .map_err(|_| Error::Kcd(format!("bad <Value min='{s}'>")))?,
                        );
                    }
                    if let Some(s) = attr_value(&e, "max")? {
                        sig.max = Some(
                            s.parse()
                                .map_err(|_| Error::Kcd(format!("bad <Value max='{s}'>")))?,
                        );
                    }
                    if let Some(s) = attr_value(&e, "type")? {
                        sig.signal_type = match s.as_str() {
                            "signed" => SignalType::Signed,
                            "single" => SignalType::Single,
                            "double" => SignalType::Double,
                            _ => SignalType::Unsigned,
                        };
                    }
                }
            }

            Event::Start(e) if inside_bus && local_name(&e) == b"Notes" => {
                in_notes = true;
                notes_text.clear();
            }
            Event::Empty(e) if inside_bus && local_name(&e) == b"Notes" => {
                let _ = e;
            }
            Event::End(e) if inside_bus && local_name(&e) == b"Notes" => {
                in_notes = false;
                if let Some(sig) = signal.as_mut() {
                    sig.comment = Some(std::mem::take(&mut notes_text));
                }
            }
            Event::Text(text) if in_notes => {
                notes_text.push_str(&decode_text(&text)?);
            }

            _ => {}
        }
    }

    if !inside_bus {
        return Err(Error::Kcd(format!("no bus named '{bus_name}' in document")));
    }

    Ok(config)
}

fn decode_text(text: &BytesText) -> Result<String> {
    text.unescape()
        .map(|s| s.into_owned())
        .map_err(|err| Error::Kcd(format!("malformed text content: {err}")))
}

fn finalize_message(config: &mut Configuration, builder: MessageBuilder) -> Result<()> {
    log::debug!("parsed frame definition '{}'", builder.name);
    let mut def = CanFrameDefinition::new(builder.frame_id, builder.name, builder.format)?;
    def.set_dlc(builder.dlc)?;
    def.set_cycle_time(builder.cycle_time)?;
    def.set_producer_ids(builder.producer_ids);
    for signal in builder.signals {
        def.add_signal(signal)?;
    }
    config.add(def)
}

fn finalize_signal(message: Option<&mut MessageBuilder>, builder: SignalBuilder) -> Result<()> {
    log::debug!("parsed signal '{}'", builder.name);
    let mut signal = CanSignalDefinition::new(
        builder.name,
        builder.start_bit,
        builder.num_bits,
        builder.endianness,
        builder.signal_type,
        builder.scale,
        builder.offset,
        builder.min,
        builder.max,
        None,
    )?;
    if let Some(unit) = builder.unit {
        signal = signal.with_unit(unit);
    }
    if let Some(comment) = builder.comment {
        if !comment.is_empty() {
            signal = signal.with_comment(comment);
        }
    }
    if let Some(message) = message {
        message.signals.push(signal);
    }
    Ok(())
}

fn parse_hex_id(s: &str) -> Result<u32> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).ok_or_else(|| {
        Error::Kcd(format!("frame id '{s}' is not a 0x-prefixed hex literal"))
    })?;
    u32::from_str_radix(digits, 16).map_err(|_| Error::Kcd(format!("bad frame id '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<NetworkDefinition xmlns="http://kayak.2codeornot2code.org/1.0">
  <Document/>
  <Bus name="Zeta">
    <Message id="0x100" name="OtherBus" length="8">
      <Signal name="z" offset="0"/>
    </Message>
  </Bus>
  <Bus name="Alpha">
    <Message id="0x1" name="Engine" length="8" interval="100">
      <Producer>
        <NodeRef id="ECU_A"/>
      </Producer>
      <Signal name="rpm" offset="0" length="16">
        <Value slope="0.25" unit="rpm" min="0" max="8000"/>
      </Signal>
      <Signal name="flag" offset="16" endianess="big">
        <Notes>a single status bit</Notes>
      </Signal>
    </Message>
  </Bus>
</NetworkDefinition>
"#;

    #[test]
    fn selects_alphabetically_first_bus_by_default() {
        let config = from_kcd_str(SAMPLE, None).unwrap();
        assert_eq!(config.bus_name(), Some("Alpha"));
        assert_eq!(config.frame_definitions().len(), 1);
        assert!(config.frame_definitions().contains_key(&1));
    }

    #[test]
    fn selects_explicit_bus_by_name() {
        let config = from_kcd_str(SAMPLE, Some("Zeta")).unwrap();
        assert_eq!(config.bus_name(), Some("Zeta"));
        assert!(config.frame_definitions().contains_key(&0x100));
    }

    #[test]
    fn unknown_bus_name_is_an_error() {
        assert!(from_kcd_str(SAMPLE, Some("Nope")).is_err());
    }

    #[test]
    fn parses_signal_attributes_and_defaults() {
        let config = from_kcd_str(SAMPLE, Some("Alpha")).unwrap();
        let def = &config.frame_definitions()[&1];
        assert_eq!(def.cycle_time(), Some(100));
        assert_eq!(def.producer_ids().iter().next().unwrap(), "ECU_A");

        let rpm = def.signal("rpm").unwrap();
        assert_eq!(rpm.num_bits(), 16);
        assert_eq!(rpm.scale(), 0.25);
        assert_eq!(rpm.min(), Some(0.0));
        assert_eq!(rpm.max(), Some(8000.0));

        let flag = def.signal("flag").unwrap();
        assert_eq!(flag.num_bits(), 1);
        assert_eq!(flag.endianness(), Endianness::Big);
        assert_eq!(flag.comment(), Some("a single status bit"));
    }

    #[test]
    fn write_then_read_roundtrips_frame_and_signal_shape() {
        let original = from_kcd_str(SAMPLE, Some("Alpha")).unwrap();
        let xml = to_kcd_string(&original).unwrap();
        let reparsed = from_kcd_str(&xml, None).unwrap();

        let def = &reparsed.frame_definitions()[&1];
        assert_eq!(def.name(), "Engine");
        assert_eq!(def.cycle_time(), Some(100));
        let rpm = def.signal("rpm").unwrap();
        assert_eq!(rpm.scale(), 0.25);
        assert_eq!(rpm.min(), Some(0.0));
    }

    #[test]
    fn omits_default_valued_attributes_on_write() {
        let mut config = Configuration::new();
        let mut def = CanFrameDefinition::new(1, "Plain", FrameFormat::Standard).unwrap();
        def.add_signal(
            CanSignalDefinition::new(
                "s", 0, 8, Endianness::Little, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        config.add(def).unwrap();

        let xml = to_kcd_string(&config).unwrap();
        assert!(!xml.contains("slope"));
        assert!(!xml.contains("intercept"));
        assert!(!xml.contains("type="));
        assert!(!xml.contains("endianess"));
    }
}
