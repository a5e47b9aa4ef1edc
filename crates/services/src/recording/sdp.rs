//! SDP describing the compositor's RTP inputs, derived from each
//! consumer's negotiated RTP parameters. Only mime type, payload type,
//! clock rate, channels and fmtp are read; everything else in the
//! parameters stays opaque.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct SdpStream {
    pub encoding_name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: Option<String>,
}

/// Extracts the first codec of a consumer's serialized `RtpParameters`.
pub fn stream_from_rtp_parameters(rtp_parameters: &Value) -> Option<SdpStream> {
    let codec = rtp_parameters.get("codecs")?.as_array()?.first()?;
    let mime = codec.get("mimeType")?.as_str()?;
    let encoding_name = mime.split('/').nth(1)?.to_string();
    let payload_type = codec.get("payloadType")?.as_u64()? as u8;
    let clock_rate = codec.get("clockRate")?.as_u64()? as u32;
    let channels = codec.get("channels").and_then(|c| c.as_u64()).map(|c| c as u8);

    let fmtp = codec
        .get("parameters")
        .and_then(|p| p.as_object())
        .filter(|p| !p.is_empty())
        .map(|params| {
            let mut pairs: Vec<String> = params
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}={s}"),
                    other => format!("{k}={other}"),
                })
                .collect();
            pairs.sort();
            pairs.join(";")
        });

    Some(SdpStream {
        encoding_name,
        payload_type,
        clock_rate,
        channels,
        fmtp,
    })
}

/// Renders the session description: one audio section, one video section
/// listing every attached video payload.
pub fn render(
    bind_ip: &str,
    audio_port: u16,
    video_port: u16,
    audio: Option<&SdpStream>,
    videos: &[SdpStream],
) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- 0 0 IN IP4 {bind_ip}\r\n"));
    sdp.push_str("s=Connect Composite\r\n");
    sdp.push_str(&format!("c=IN IP4 {bind_ip}\r\n"));
    sdp.push_str("t=0 0\r\n");

    if let Some(stream) = audio {
        sdp.push_str(&format!(
            "m=audio {audio_port} RTP/AVP {}\r\n",
            stream.payload_type
        ));
        push_rtpmap(&mut sdp, stream);
    }

    if !videos.is_empty() {
        let payloads: Vec<String> = videos.iter().map(|s| s.payload_type.to_string()).collect();
        sdp.push_str(&format!(
            "m=video {video_port} RTP/AVP {}\r\n",
            payloads.join(" ")
        ));
        for stream in videos {
            push_rtpmap(&mut sdp, stream);
        }
    }

    sdp
}

fn push_rtpmap(sdp: &mut String, stream: &SdpStream) {
    match stream.channels {
        Some(channels) => sdp.push_str(&format!(
            "a=rtpmap:{} {}/{}/{}\r\n",
            stream.payload_type, stream.encoding_name, stream.clock_rate, channels
        )),
        None => sdp.push_str(&format!(
            "a=rtpmap:{} {}/{}\r\n",
            stream.payload_type, stream.encoding_name, stream.clock_rate
        )),
    }
    if let Some(fmtp) = &stream.fmtp {
        sdp.push_str(&format!("a=fmtp:{} {}\r\n", stream.payload_type, fmtp));
    }
    sdp.push_str("a=recvonly\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opus_parameters() -> Value {
        json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": { "useinbandfec": 1 },
            }],
            "encodings": [{ "ssrc": 1111 }],
        })
    }

    fn vp8_parameters() -> Value {
        json!({
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "parameters": {},
            }],
            "encodings": [{ "ssrc": 2222 }],
        })
    }

    #[test]
    fn extracts_codec_essentials() {
        let stream = stream_from_rtp_parameters(&opus_parameters()).unwrap();
        assert_eq!(stream.encoding_name, "opus");
        assert_eq!(stream.payload_type, 100);
        assert_eq!(stream.clock_rate, 48000);
        assert_eq!(stream.channels, Some(2));
        assert_eq!(stream.fmtp.as_deref(), Some("useinbandfec=1"));
    }

    #[test]
    fn renders_audio_and_video_sections() {
        let audio = stream_from_rtp_parameters(&opus_parameters()).unwrap();
        let video = stream_from_rtp_parameters(&vp8_parameters()).unwrap();

        let sdp = render("127.0.0.1", 50000, 50001, Some(&audio), &[video]);

        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(sdp.contains("m=audio 50000 RTP/AVP 100\r\n"));
        assert!(sdp.contains("a=rtpmap:100 opus/48000/2\r\n"));
        assert!(sdp.contains("a=fmtp:100 useinbandfec=1\r\n"));
        assert!(sdp.contains("m=video 50001 RTP/AVP 101\r\n"));
        assert!(sdp.contains("a=rtpmap:101 VP8/90000\r\n"));
    }

    #[test]
    fn missing_codecs_yield_none() {
        assert!(stream_from_rtp_parameters(&json!({})).is_none());
    }
}
