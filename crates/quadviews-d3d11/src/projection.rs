use std::ffi::c_void;

use windows::core::s;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_ENABLE_STRICTNESS};
use windows::Win32::Graphics::Direct3D::{
    ID3DBlob, D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D11_SRV_DIMENSION_TEXTURE2DARRAY,
};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Buffer, ID3D11PixelShader, ID3D11RenderTargetView, ID3D11SamplerState, ID3D11ShaderResourceView,
    ID3D11VertexShader, D3D11_BIND_CONSTANT_BUFFER, D3D11_BUFFER_DESC, D3D11_COMPARISON_NEVER,
    D3D11_FILTER_MIN_MAG_MIP_LINEAR, D3D11_RENDER_TARGET_VIEW_DESC, D3D11_RENDER_TARGET_VIEW_DESC_0,
    D3D11_RTV_DIMENSION_TEXTURE2DARRAY, D3D11_SAMPLER_DESC, D3D11_SHADER_RESOURCE_VIEW_DESC,
    D3D11_SHADER_RESOURCE_VIEW_DESC_0, D3D11_TEX2D_ARRAY_RTV, D3D11_TEX2D_ARRAY_SRV,
    D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_USAGE_DEFAULT, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT;

use crate::device::Device;
use crate::resources::Texture;
use crate::{D3D11Error, Result};

const SHADER_SOURCE: &str = include_str!("projection.hlsl");
const SHARPEN_SOURCE: &str = include_str!("sharpen.hlsl");

/// Size of the uniform block, in bytes.
pub const UNIFORMS_SIZE: u32 = 128;

/// Size of the sharpening uniform block, in bytes.
pub const SHARPEN_UNIFORMS_SIZE: u32 = 32;

/// Inputs and output of one projection draw.
pub struct ProjectionTargets<'a> {
    pub peripheral: &'a Texture,
    pub peripheral_layer: u32,
    pub focus: &'a Texture,
    pub focus_layer: u32,
    pub output: &'a Texture,
    pub output_layer: u32,
    /// x, y, width, height in output texels.
    pub viewport: [f32; 4],
}

/// Compiled projection pipeline of one device.
pub struct ProjectionPass {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    sampler: ID3D11SamplerState,
    uniforms: ID3D11Buffer,
}

// SAFETY: pipeline objects are free-threaded; drawing goes through the device's locked context.
unsafe impl Send for ProjectionPass {}

impl ProjectionPass {
    pub(crate) fn new(device: &Device) -> Result<Self> {
        let raw = device.raw();
        let vs_blob = compile(SHADER_SOURCE, s!("vs_main"), s!("vs_5_0"))?;
        let ps_blob = compile(SHADER_SOURCE, s!("ps_main"), s!("ps_5_0"))?;

        let mut vertex_shader: Option<ID3D11VertexShader> = None;
        let mut pixel_shader: Option<ID3D11PixelShader> = None;
        let mut sampler: Option<ID3D11SamplerState> = None;
        let mut uniforms: Option<ID3D11Buffer> = None;
        unsafe {
            raw.CreateVertexShader(blob_bytes(&vs_blob), None, Some(&mut vertex_shader))?;
            raw.CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut pixel_shader))?;

            let sampler_desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                MipLODBias: 0.0,
                MaxAnisotropy: 1,
                ComparisonFunc: D3D11_COMPARISON_NEVER,
                BorderColor: [0.0; 4],
                MinLOD: 0.0,
                MaxLOD: f32::MAX,
            };
            raw.CreateSamplerState(&sampler_desc, Some(&mut sampler))?;

            raw.CreateBuffer(&constant_buffer_desc(UNIFORMS_SIZE), None, Some(&mut uniforms))?;
        }

        Ok(Self {
            vertex_shader: vertex_shader.ok_or(D3D11Error::NullPointer("CreateVertexShader"))?,
            pixel_shader: pixel_shader.ok_or(D3D11Error::NullPointer("CreatePixelShader"))?,
            sampler: sampler.ok_or(D3D11Error::NullPointer("CreateSamplerState"))?,
            uniforms: uniforms.ok_or(D3D11Error::NullPointer("CreateBuffer"))?,
        })
    }

    /// Draw one eye. `uniforms` is the raw uniform block.
    pub fn render(&self, device: &Device, targets: &ProjectionTargets<'_>, uniforms: &[u8]) -> Result<()> {
        if uniforms.len() != UNIFORMS_SIZE as usize {
            return Err(D3D11Error::Shader(format!(
                "uniform block is {} bytes, expected {}",
                uniforms.len(),
                UNIFORMS_SIZE
            )));
        }

        let peripheral = shader_view(device, targets.peripheral, targets.peripheral_layer)?;
        let focus = shader_view(device, targets.focus, targets.focus_layer)?;
        let output = render_view(device, targets.output, targets.output_layer)?;
        let [x, y, width, height] = targets.viewport;
        let viewport = D3D11_VIEWPORT {
            TopLeftX: x,
            TopLeftY: y,
            Width: width,
            Height: height,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };

        let context = device.context();
        unsafe {
            context.UpdateSubresource(&self.uniforms, 0, None, uniforms.as_ptr() as *const c_void, 0, 0);
            context.IASetInputLayout(None);
            context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.VSSetShader(&self.vertex_shader, None);
            context.PSSetShader(&self.pixel_shader, None);
            context.PSSetConstantBuffers(0, Some(&[Some(self.uniforms.clone())]));
            context.PSSetShaderResources(0, Some(&[Some(peripheral), Some(focus)]));
            context.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));
            context.OMSetRenderTargets(Some(&[Some(output)]), None);
            context.OMSetBlendState(None, None, u32::MAX);
            context.RSSetState(None);
            context.RSSetViewports(Some(&[viewport]));
            context.Draw(3, 0);

            context.PSSetShaderResources(0, Some(&[None, None]));
            context.OMSetRenderTargets(None, None);
        }
        Ok(())
    }
}

/// Sharpening pass of one device: source and output rectangles of equal size.
pub struct SharpenPass {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    uniforms: ID3D11Buffer,
}

// SAFETY: as for `ProjectionPass`.
unsafe impl Send for SharpenPass {}

impl SharpenPass {
    pub(crate) fn new(device: &Device) -> Result<Self> {
        let raw = device.raw();
        let vs_blob = compile(SHARPEN_SOURCE, s!("vs_main"), s!("vs_5_0"))?;
        let ps_blob = compile(SHARPEN_SOURCE, s!("ps_main"), s!("ps_5_0"))?;

        let mut vertex_shader: Option<ID3D11VertexShader> = None;
        let mut pixel_shader: Option<ID3D11PixelShader> = None;
        let mut uniforms: Option<ID3D11Buffer> = None;
        unsafe {
            raw.CreateVertexShader(blob_bytes(&vs_blob), None, Some(&mut vertex_shader))?;
            raw.CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut pixel_shader))?;
            raw.CreateBuffer(&constant_buffer_desc(SHARPEN_UNIFORMS_SIZE), None, Some(&mut uniforms))?;
        }

        Ok(Self {
            vertex_shader: vertex_shader.ok_or(D3D11Error::NullPointer("CreateVertexShader"))?,
            pixel_shader: pixel_shader.ok_or(D3D11Error::NullPointer("CreatePixelShader"))?,
            uniforms: uniforms.ok_or(D3D11Error::NullPointer("CreateBuffer"))?,
        })
    }

    /// Sharpen `source` into `output`. `viewport` is the output rectangle.
    pub fn render(
        &self,
        device: &Device,
        source: (&Texture, u32),
        output: (&Texture, u32),
        viewport: [f32; 4],
        uniforms: &[u8],
    ) -> Result<()> {
        if uniforms.len() != SHARPEN_UNIFORMS_SIZE as usize {
            return Err(D3D11Error::Shader(format!(
                "sharpening uniform block is {} bytes, expected {}",
                uniforms.len(),
                SHARPEN_UNIFORMS_SIZE
            )));
        }

        let source = shader_view(device, source.0, source.1)?;
        let output = render_view(device, output.0, output.1)?;
        let [x, y, width, height] = viewport;
        let viewport = D3D11_VIEWPORT {
            TopLeftX: x,
            TopLeftY: y,
            Width: width,
            Height: height,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };

        let context = device.context();
        unsafe {
            context.UpdateSubresource(&self.uniforms, 0, None, uniforms.as_ptr() as *const c_void, 0, 0);
            context.IASetInputLayout(None);
            context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.VSSetShader(&self.vertex_shader, None);
            context.PSSetShader(&self.pixel_shader, None);
            context.PSSetConstantBuffers(0, Some(&[Some(self.uniforms.clone())]));
            context.PSSetShaderResources(0, Some(&[Some(source)]));
            context.OMSetRenderTargets(Some(&[Some(output)]), None);
            context.OMSetBlendState(None, None, u32::MAX);
            context.RSSetState(None);
            context.RSSetViewports(Some(&[viewport]));
            context.Draw(3, 0);

            context.PSSetShaderResources(0, Some(&[None]));
            context.OMSetRenderTargets(None, None);
        }
        Ok(())
    }
}

fn constant_buffer_desc(size: u32) -> D3D11_BUFFER_DESC {
    D3D11_BUFFER_DESC {
        ByteWidth: size,
        Usage: D3D11_USAGE_DEFAULT,
        BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
        CPUAccessFlags: 0,
        MiscFlags: 0,
        StructureByteStride: 0,
    }
}

fn compile(source: &str, entry_point: windows::core::PCSTR, target: windows::core::PCSTR) -> Result<ID3DBlob> {
    let mut blob: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const c_void,
            source.len(),
            None,
            None,
            None,
            entry_point,
            target,
            D3DCOMPILE_ENABLE_STRICTNESS,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };
    if let Err(e) = result {
        let message = errors
            .map(|errors| String::from_utf8_lossy(unsafe { blob_bytes(&errors) }).into_owned())
            .unwrap_or_else(|| e.to_string());
        return Err(D3D11Error::Shader(message));
    }
    blob.ok_or_else(|| D3D11Error::Shader("compiler returned no bytecode".to_string()))
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

fn shader_view(device: &Device, texture: &Texture, layer: u32) -> Result<ID3D11ShaderResourceView> {
    let desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
        Format: DXGI_FORMAT(texture.info.format as i32),
        ViewDimension: D3D11_SRV_DIMENSION_TEXTURE2DARRAY,
        Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
            Texture2DArray: D3D11_TEX2D_ARRAY_SRV {
                MostDetailedMip: 0,
                MipLevels: 1,
                FirstArraySlice: layer,
                ArraySize: 1,
            },
        },
    };
    let mut view: Option<ID3D11ShaderResourceView> = None;
    unsafe {
        device
            .raw()
            .CreateShaderResourceView(&texture.texture, Some(&desc), Some(&mut view))?
    };
    view.ok_or(D3D11Error::NullPointer("CreateShaderResourceView"))
}

fn render_view(device: &Device, texture: &Texture, layer: u32) -> Result<ID3D11RenderTargetView> {
    let desc = D3D11_RENDER_TARGET_VIEW_DESC {
        Format: DXGI_FORMAT(texture.info.format as i32),
        ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2DARRAY,
        Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
            Texture2DArray: D3D11_TEX2D_ARRAY_RTV {
                MipSlice: 0,
                FirstArraySlice: layer,
                ArraySize: 1,
            },
        },
    };
    let mut view: Option<ID3D11RenderTargetView> = None;
    unsafe {
        device
            .raw()
            .CreateRenderTargetView(&texture.texture, Some(&desc), Some(&mut view))?
    };
    view.ok_or(D3D11Error::NullPointer("CreateRenderTargetView"))
}
